//! A [`Backend`] speaking the InfluxDB 1.x HTTP API
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, header};
use parking_lot::RwLock;
use proxy_config_store::HostInfo;
use reqwest::{Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};
use url::Url;

use crate::{Backend, Error, QueryParams, Response, Result, WriteParams};

const VERSION_HEADER: &str = "X-Influxdb-Version";

/// Headers of the inbound request that are relayed to the host on writes and queries
const RELAYED_HEADERS: [HeaderName; 2] = [header::ACCEPT, header::CONTENT_TYPE];

/// Headers of a raw query that belong to the inbound connection and are not relayed
const CONNECTION_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::AUTHORIZATION,
];

#[derive(Debug)]
struct Connection {
    base_url: Url,
    username: String,
    password: Secret<String>,
    disabled: bool,
}

impl Connection {
    fn new(name: &str, info: &HostInfo) -> Result<Self> {
        let address = info.base_url();
        let base_url = Url::parse(&address).map_err(|source| Error::InvalidAddress {
            backend: name.to_string(),
            address,
            source,
        })?;
        Ok(Self {
            base_url,
            username: info.username.clone(),
            password: Secret::new(info.password.clone()),
            disabled: info.disabled,
        })
    }
}

/// An InfluxDB host reached over HTTP
#[derive(Debug)]
pub struct HttpBackend {
    name: String,
    connection: RwLock<Arc<Connection>>,
    /// Whether the host is configured to serve queries
    configured_readable: AtomicBool,
    /// Cleared by network failures, set again by a successful ping
    reachable: AtomicBool,
    http_client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, info: &HostInfo, http_client: reqwest::Client) -> Result<Self> {
        let name = name.into();
        let connection = Connection::new(&name, info)?;
        Ok(Self {
            name,
            connection: RwLock::new(Arc::new(connection)),
            configured_readable: AtomicBool::new(info.readable),
            reachable: AtomicBool::new(true),
            http_client,
        })
    }

    fn connection(&self) -> Arc<Connection> {
        Arc::clone(&self.connection.read())
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let connection = self.connection();
        let url = connection
            .base_url
            .join(path)
            .map_err(|source| Error::InvalidAddress {
                backend: self.name.clone(),
                address: connection.base_url.to_string(),
                source,
            })?;
        let mut req = self.http_client.request(method, url);
        if !connection.username.is_empty() {
            req = req.basic_auth(
                &connection.username,
                Some(connection.password.expose_secret()),
            );
        }
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response> {
        req.send().await.map_err(|e| Error::Network {
            backend: self.name.clone(),
            message: e.to_string(),
        })
    }

    async fn read_response(&self, resp: reqwest::Response) -> Result<Response> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| Error::ReadBody {
            backend: self.name.clone(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            warn!(backend = %self.name, %status, body = %String::from_utf8_lossy(&body), "backend answered with error status");
        }
        Ok(Response {
            status,
            headers,
            body,
        })
    }

    /// Send a read request, taking the host out of rotation when it cannot be reached
    async fn send_read(&self, req: RequestBuilder) -> Result<Response> {
        let result = match self.send(req).await {
            Ok(resp) => self.read_response(resp).await,
            Err(e) => Err(e),
        };
        if let Err(e @ Error::Network { .. }) = &result {
            warn!(backend = %self.name, error = %e, "marking backend unreadable");
            self.reachable.store(false, Ordering::SeqCst);
        }
        result
    }

    fn post_query(&self, params: &QueryParams, headers: &HeaderMap) -> Result<RequestBuilder> {
        let mut query = vec![("q", params.sql.as_str()), ("db", params.db.as_str())];
        for (key, value) in [
            ("epoch", &params.epoch),
            ("pretty", &params.pretty),
            ("chunked", &params.chunked),
            ("chunk_size", &params.chunk_size),
        ] {
            if !value.is_empty() {
                query.push((key, value.as_str()));
            }
        }
        Ok(relay_headers(self.request(Method::POST, "/query")?, headers).query(&query))
    }
}

fn relay_headers(mut req: RequestBuilder, headers: &HeaderMap) -> RequestBuilder {
    for name in RELAYED_HEADERS {
        for value in headers.get_all(&name) {
            req = req.header(name.clone(), value.clone());
        }
    }
    req
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn disabled(&self) -> bool {
        self.connection().disabled
    }

    fn readable(&self) -> bool {
        self.configured_readable.load(Ordering::SeqCst) && self.reachable.load(Ordering::SeqCst)
    }

    fn reset(&self, info: &HostInfo) -> Result<()> {
        let connection = Connection::new(&self.name, info)?;
        *self.connection.write() = Arc::new(connection);
        self.configured_readable.store(info.readable, Ordering::SeqCst);
        debug!(backend = %self.name, address = %info.base_url(), "backend reset");
        Ok(())
    }

    fn describe(&self) -> String {
        let connection = self.connection();
        format!(
            "backend:{},address:{},readable:{},disabled:{}",
            self.name,
            connection.base_url,
            self.readable(),
            connection.disabled
        )
    }

    async fn write(
        &self,
        params: &WriteParams,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let mut query = vec![("db", params.db.as_str())];
        for (key, value) in [
            ("consistency", &params.consistency),
            ("precision", &params.precision),
            ("rp", &params.rp),
        ] {
            if !value.is_empty() {
                query.push((key, value.as_str()));
            }
        }
        let req = relay_headers(self.request(Method::POST, "/write")?, headers)
            .query(&query)
            .body(body);
        let resp = self.send(req).await?;
        self.read_response(resp).await
    }

    async fn query(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response> {
        let req = self.post_query(params, headers)?;
        self.send_read(req).await
    }

    async fn create_database(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response> {
        let req = self.post_query(params, headers)?;
        let resp = self.send(req).await?;
        self.read_response(resp).await
    }

    async fn raw_query(&self, body: Bytes, headers: &HeaderMap) -> Result<Response> {
        let mut relayed = headers.clone();
        for name in CONNECTION_HEADERS {
            relayed.remove(name);
        }
        let req = self
            .request(Method::POST, "/api/v2/query")?
            .headers(relayed)
            .body(body);
        self.send_read(req).await
    }

    async fn ping(&self) -> Result<Option<String>> {
        let resp = self.send(self.request(Method::GET, "/ping")?).await?;
        let status = resp.status();
        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            return Err(Error::Ping {
                backend: self.name.clone(),
                status,
            });
        }
        let version = resp
            .headers()
            .get(VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        if !self.reachable.swap(true, Ordering::SeqCst) {
            debug!(backend = %self.name, "backend reachable again");
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use mockito::{Matcher, Server};
    use pretty_assertions::assert_eq;

    use super::*;

    fn host_info(server: &mockito::ServerGuard) -> HostInfo {
        let url = Url::parse(&server.url()).unwrap();
        HostInfo::new(url.host_str().unwrap(), url.port().unwrap())
    }

    #[tokio::test]
    async fn write_sends_params_and_auth() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("POST", "/write")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("db".into(), "db1".into()),
                Matcher::UrlEncoded("precision".into(), "s".into()),
            ]))
            // admin:secret
            .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
            .match_body("cpu,host=a usage=1\n")
            .with_status(204)
            .create_async()
            .await;

        let info = host_info(&mock_server).with_credentials("admin", "secret");
        let backend = HttpBackend::new("h1", &info, reqwest::Client::new()).unwrap();
        let params = WriteParams {
            precision: "s".to_string(),
            ..WriteParams::new("db1")
        };
        let resp = backend
            .write(
                &params,
                Bytes::from_static(b"cpu,host=a usage=1\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NO_CONTENT);

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn query_relays_body_and_status() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("POST", "/query")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "select * from cpu".into()),
                Matcher::UrlEncoded("db".into(), "db1".into()),
                Matcher::UrlEncoded("epoch".into(), "ms".into()),
            ]))
            .with_status(400)
            .with_body(r#"{"error":"bad"}"#)
            .create_async()
            .await;

        let backend = HttpBackend::new("h1", &host_info(&mock_server), reqwest::Client::new()).unwrap();
        let params = QueryParams {
            epoch: "ms".to_string(),
            ..QueryParams::new("db1", "select * from cpu")
        };
        let resp = backend.query(&params, &HeaderMap::new()).await.unwrap();
        assert_eq!(resp.status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.body_str(), r#"{"error":"bad"}"#);
        assert!(backend.readable());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn network_error_marks_unreadable_until_ping() {
        let info = HostInfo::new("127.0.0.1", 1);
        let backend = HttpBackend::new("h1", &info, reqwest::Client::new()).unwrap();

        let err = backend
            .query(&QueryParams::new("db1", "select 1"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Network { .. });
        assert!(err.is_retryable());
        assert!(!backend.readable());

        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("GET", "/ping")
            .with_status(204)
            .with_header("X-Influxdb-Version", "1.8.10")
            .create_async()
            .await;
        backend.reset(&host_info(&mock_server)).unwrap();
        assert_eq!(backend.ping().await.unwrap().as_deref(), Some("1.8.10"));
        assert!(backend.readable());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn raw_query_forwards_headers() {
        let mut mock_server = Server::new_async().await;
        let mock = mock_server
            .mock("POST", "/api/v2/query")
            .match_header("db", "db1")
            .match_header("measurement", "cpu")
            .match_body("from(bucket: \"db1\")")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let backend = HttpBackend::new("h1", &host_info(&mock_server), reqwest::Client::new()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("db", "db1".parse().unwrap());
        headers.insert("measurement", "cpu".parse().unwrap());
        headers.insert(header::HOST, "proxy:10201".parse().unwrap());
        let resp = backend
            .raw_query(Bytes::from_static(b"from(bucket: \"db1\")"), &headers)
            .await
            .unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"ok"));

        mock.assert_async().await;
    }

    #[test]
    fn reset_applies_new_settings() {
        let backend = HttpBackend::new("h1", &HostInfo::new("a", 8086), reqwest::Client::new()).unwrap();
        assert!(!backend.disabled());

        backend
            .reset(&HostInfo::new("b", 8087).with_disabled(true).with_readable(false))
            .unwrap();
        assert!(backend.disabled());
        assert!(!backend.readable());
        assert_eq!(
            backend.describe(),
            "backend:h1,address:http://b:8087/,readable:false,disabled:true"
        );

        assert_matches!(
            backend.reset(&HostInfo::new("bad host", 1)),
            Err(Error::InvalidAddress { .. })
        );
    }
}
