use std::{collections::BTreeMap, convert::Infallible, sync::Arc};

use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{
        ACCEPT, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING,
    },
    request::Parts,
};
use hyper::{Body, Request, Response};
use proxy_backend::{QueryParams, WriteParams};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::{
    Error, Result,
    body::parse_body,
    middleware::{
        AdminAuth, AllowMethods, Available, BasicAuth, Chain, Gate, Received, Recover,
        SingleWordDb,
    },
    service::ProxyService,
};

const GET: &[Method] = &[Method::GET];
const POST: &[Method] = &[Method::POST];
const GET_POST: &[Method] = &[Method::GET, Method::POST];

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    Query,
    RawQuery,
    Write,
    CreateDatabase,
    Reload,
    Switch,
    Debug,
    Print,
    Metrics,
}

#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) handler: Handler,
    pub(crate) chain: Chain,
}

/// Data endpoints, from the method check out to panic recovery
fn traffic(inner: Chain, methods: &'static [Method]) -> Chain {
    inner
        .with(AllowMethods(methods))
        .with(BasicAuth)
        .with(Available)
        .with(Received)
        .with(Gate::Shared)
        .with(Recover)
}

fn admin(gate: Gate) -> Chain {
    Chain::default()
        .with(AllowMethods(GET))
        .with(AdminAuth)
        .with(gate)
        .with(Recover)
}

pub(crate) fn endpoints() -> BTreeMap<&'static str, Endpoint> {
    let endpoint = |handler, chain| Endpoint { handler, chain };
    BTreeMap::from([
        (
            "/query",
            endpoint(Handler::Query, traffic(Chain::default(), GET_POST)),
        ),
        (
            "/api/v2/query",
            endpoint(Handler::RawQuery, traffic(Chain::default(), POST)),
        ),
        (
            "/write",
            endpoint(Handler::Write, traffic(Chain::default(), POST)),
        ),
        (
            "/create_database",
            endpoint(
                Handler::CreateDatabase,
                traffic(Chain::default().with(SingleWordDb), POST),
            ),
        ),
        ("/reload", endpoint(Handler::Reload, admin(Gate::Exclusive))),
        ("/switch", endpoint(Handler::Switch, admin(Gate::Exclusive))),
        ("/debug", endpoint(Handler::Debug, admin(Gate::Exclusive))),
        ("/print", endpoint(Handler::Print, admin(Gate::Shared))),
        (
            "/metrics",
            endpoint(
                Handler::Metrics,
                Chain::default().with(AllowMethods(GET)).with(Recover),
            ),
        ),
    ])
}

pub(crate) async fn route_request(
    service: Arc<ProxyService>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let content_length = req.headers().get(CONTENT_LENGTH).cloned();
    let db = request_db(&req);

    let Some((path, endpoint)) = service.endpoint(uri.path()) else {
        let error = Error::NoHandler;
        debug!(%error, %method, %uri, "Error while handling request");
        return Ok(error.response());
    };

    let response = match endpoint.chain.run(&service, path, endpoint.handler, req).await {
        Ok(response) => response,
        Err(error) => {
            let response = error.response();
            if response.status().is_server_error() {
                error!(%error, %method, %uri, ?content_length, "Error while handling request");
            } else {
                debug!(%error, %method, %uri, ?content_length, "Error while handling request");
            }
            response
        }
    };
    service.metrics().handled(path, &db, response.status());
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct DbParam {
    #[serde(default)]
    db: String,
}

/// The `db` URL parameter, or the `db` header raw queries carry
pub(crate) fn request_db<B>(req: &Request<B>) -> String {
    let db = req
        .uri()
        .query()
        .and_then(|query| serde_urlencoded::from_str::<DbParam>(query).ok())
        .map(|param| param.db.trim().to_string())
        .unwrap_or_default();
    if !db.is_empty() {
        return db;
    }
    req.headers()
        .get("db")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Request fields from a url-encoded POST body followed by the URL query
#[derive(Debug, Default)]
struct Form(Vec<(String, String)>);

impl Form {
    async fn read(req: Request<Body>, max_size: usize) -> Result<(Parts, Self)> {
        let (parts, body) = req.into_parts();
        let mut pairs = vec![];
        if parts.method == Method::POST && is_form(&parts.headers) {
            let body = parse_body(&parts.headers, body, max_size).await?;
            pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(&body)?;
        }
        if let Some(query) = parts.uri.query() {
            pairs.extend(serde_urlencoded::from_str::<Vec<(String, String)>>(query)?);
        }
        Ok((parts, Self(pairs)))
    }

    /// The first value of `key`, trimmed
    fn value(&self, key: &str) -> String {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default()
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Headers forwarded with a body the proxy has already decoded
fn forwarded_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    headers
}

/// Turn a backend response into the client's, dropping hop-by-hop framing
fn relay(response: proxy_backend::Response) -> Response<Body> {
    let proxy_backend::Response {
        status,
        mut headers,
        body,
    } = response;
    for name in [CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION] {
        headers.remove(name);
    }
    let mut relayed = Response::new(Body::from(body));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    relayed
}

fn text(status: StatusCode, body: impl Into<String>) -> Result<Response<Body>> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, TEXT_CONTENT_TYPE)
        .body(Body::from(body.into()))?)
}

/// The type of a query response, following `Accept` unless it is a wildcard
fn query_content_type(headers: &HeaderMap) -> HeaderValue {
    headers
        .get(ACCEPT)
        .filter(|v| !v.is_empty() && v.to_str().is_ok_and(|v| !v.contains('*')))
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/json"))
}

#[derive(Debug, Deserialize)]
struct WriteQuery {
    #[serde(default)]
    db: String,
    #[serde(default)]
    precision: String,
    #[serde(default)]
    consistency: String,
    #[serde(default)]
    rp: String,
}

#[derive(Debug, Deserialize)]
struct DebugQuery {
    #[serde(default)]
    operation: String,
}

impl ProxyService {
    pub(crate) async fn handle(&self, handler: Handler, req: Request<Body>) -> Result<Response<Body>> {
        match handler {
            Handler::Query => self.query(req).await,
            Handler::RawQuery => self.raw_query(req).await,
            Handler::Write => self.write(req).await,
            Handler::CreateDatabase => self.create_database(req).await,
            Handler::Reload => {
                self.reload().await?;
                Ok(Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .body(Body::empty())?)
            }
            Handler::Switch => {
                self.switch_available().await?;
                Ok(Response::new(Body::empty()))
            }
            Handler::Debug => self.debug(req),
            Handler::Print => self.print(),
            Handler::Metrics => Ok(Response::builder()
                .header(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)
                .body(Body::from(self.registry().render_prometheus()))?),
        }
    }

    async fn query(&self, req: Request<Body>) -> Result<Response<Body>> {
        let generation = self.generation();
        let (parts, form) = Form::read(req, generation.config.max_request_size).await?;
        let params = QueryParams {
            db: form.value("db"),
            sql: form.value("q"),
            epoch: form.value("epoch"),
            pretty: form.value("pretty"),
            chunked: form.value("chunked"),
            chunk_size: form.value("chunk_size"),
        };
        debug!(db = %params.db, sql = %params.sql, "query");

        let mut response = relay(generation.routes.query(&params, &parts.headers).await?);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, query_content_type(&parts.headers));
        Ok(response)
    }

    async fn raw_query(&self, req: Request<Body>) -> Result<Response<Body>> {
        let generation = self.generation();
        let (parts, body) = req.into_parts();
        let body = parse_body(&parts.headers, body, generation.config.max_request_size).await?;
        let headers = forwarded_headers(parts.headers);
        let response = generation
            .routes
            .raw_query(body, &headers)
            .await
            .map_err(Error::RawQuery)?;
        Ok(relay(response))
    }

    async fn write(&self, req: Request<Body>) -> Result<Response<Body>> {
        let generation = self.generation();
        let (parts, body) = req.into_parts();
        let query = serde_urlencoded::from_str::<WriteQuery>(parts.uri.query().unwrap_or_default())?;
        let params = WriteParams {
            db: query.db.trim().to_string(),
            consistency: query.consistency,
            precision: query.precision,
            rp: query.rp,
        };
        let body = parse_body(&parts.headers, body, generation.config.max_request_size).await?;
        let headers = forwarded_headers(parts.headers);
        Ok(relay(generation.routes.write(&params, body, &headers).await?))
    }

    async fn create_database(&self, req: Request<Body>) -> Result<Response<Body>> {
        let generation = self.generation();
        let (parts, form) = Form::read(req, generation.config.max_request_size).await?;
        let db = form.value("db");
        let cluster = form.value("cluster");
        info!(%db, %cluster, "create database");
        Ok(relay(
            generation
                .routes
                .create_database(&db, &cluster, &parts.headers)
                .await?,
        ))
    }

    fn debug(&self, req: Request<Body>) -> Result<Response<Body>> {
        let query = serde_urlencoded::from_str::<DebugQuery>(req.uri().query().unwrap_or_default())?;
        let verbose = match query.operation.as_str() {
            "open" => true,
            "close" => false,
            _ => return text(StatusCode::BAD_REQUEST, "no operation found\n"),
        };
        self.log_filter().set_verbose(verbose)?;
        info!(verbose, "debug logging switched");
        let state = if verbose { "open" } else { "close" };
        text(StatusCode::OK, format!("debug log {state}\n"))
    }

    fn print(&self) -> Result<Response<Body>> {
        let generation = self.generation();
        let dump = format!(
            "{}{}{}",
            generation.backends.print(),
            generation.clusters.print(),
            generation.routes.print()
        );
        text(StatusCode::OK, dump)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use async_trait::async_trait;
    use flate2::{Compression, write::GzEncoder};
    use http::header::AUTHORIZATION;
    use pretty_assertions::assert_eq;
    use proxy_backend::mock::MockBackendCall;
    use proxy_config_store::CheckStatus;

    use super::*;
    use crate::{
        BasicCredentials,
        middleware::{Middleware, Next},
        test_util::{ADMIN_TOKEN, Fixture},
    };

    const ADMIN: &str = "Token t0ken";

    async fn call(
        service: &Arc<ProxyService>,
        req: Request<Body>,
    ) -> (StatusCode, HeaderMap, String) {
        let response = route_request(Arc::clone(service), req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn request(method: Method, uri: &str) -> http::request::Builder {
        Request::builder().method(method).uri(uri)
    }

    fn admin_request(uri: &str) -> Request<Body> {
        request(Method::GET, uri)
            .header(AUTHORIZATION, ADMIN)
            .body(Body::empty())
            .unwrap()
    }

    fn error_body(message: &str) -> String {
        format!(r#"{{"results":[{{"error":"{message}"}}]}}"#)
    }

    #[test_log::test(tokio::test)]
    async fn write_goes_to_the_routed_cluster() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::POST, "/write?db=db1&precision=s")
            .body(Body::from("cpu,host=a usage=1 1"))
            .unwrap();
        let (status, _, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "{body}");

        let h1 = fixture.factory.backend("h1").unwrap();
        assert_eq!(h1.written(), vec![bytes::Bytes::from("cpu,host=a usage=1 1\n")]);
        assert_matches::assert_matches!(
            &h1.calls()[..],
            [MockBackendCall::Write { params, .. }] if params.precision == "s" && params.db == "db1"
        );
        // nothing reaches the default cluster
        assert!(fixture.factory.backend("h2").unwrap().written().is_empty());
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn gzip_write_is_decoded() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"mem,host=a used=3\n").unwrap();
        let req = request(Method::POST, "/write?db=db1")
            .header(CONTENT_ENCODING, "gzip")
            .body(Body::from(encoder.finish().unwrap()))
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            fixture.factory.backend("h2").unwrap().written(),
            vec![bytes::Bytes::from("mem,host=a used=3\n")]
        );

        let req = request(Method::POST, "/write?db=db1")
            .body(Body::from("cpu,host=a,host=b usage=1"))
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn query_from_url_and_form() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::GET, "/query?db=db1&q=select+*+from+cpu&epoch=ms")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(body, r#"{"results":[{"statement_id":0}]}"#);

        let req = request(Method::POST, "/query")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(ACCEPT, "application/csv")
            .body(Body::from("db=db1&q=select+usage+from+cpu"))
            .unwrap();
        let (status, headers, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "application/csv");

        let sqls = fixture
            .factory
            .backend("h1")
            .unwrap()
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockBackendCall::Query { params } => Some((params.sql, params.epoch)),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            sqls,
            vec![
                ("select * from cpu".to_string(), "ms".to_string()),
                ("select usage from cpu".to_string(), String::new()),
            ]
        );
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn show_databases_and_unsupported_statements() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::GET, "/query?q=show+databases")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#""values":[["db1"]]"#), "{body}");

        let req = request(Method::GET, "/query?db=db1&q=drop+database+db1")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, error_body("sql not supported"));
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn raw_query_uses_headers() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::POST, "/api/v2/query")
            .header("db", "db1")
            .header("measurement", "cpu")
            .body(Body::from("raw"))
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            fixture.factory.backend("h1").unwrap().calls(),
            vec![MockBackendCall::RawQuery {
                body: bytes::Bytes::from("raw")
            }]
        );
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn create_database_checks_name() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::POST, "/create_database?db=bad+name&cluster=cl1")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, error_body("bad db name"));

        let req = request(Method::POST, "/create_database?db=db2&cluster=cl1")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_matches::assert_matches!(
            &fixture.factory.backend("h1").unwrap().calls()[..],
            [MockBackendCall::CreateDatabase { params }] if params.sql == r#"create database "db2""#
        );
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn middleware_order() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let (status, _, body) = call(
            &service,
            request(Method::GET, "/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, error_body("not found"));

        let (status, _, body) = call(
            &service,
            request(Method::GET, "/write?db=db1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, error_body("wrong method"));

        // availability is checked before the method
        service.switch_available().await.unwrap();
        let (status, _, body) = call(
            &service,
            request(Method::GET, "/write?db=db1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, error_body("proxy not ready"));
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn basic_auth_is_required_when_configured() {
        let fixture = Fixture::new()
            .await
            .with_basic_auth("user:secret".parse::<BasicCredentials>().unwrap());
        let service = Arc::new(fixture.start().await);

        let req = request(Method::GET, "/query?db=db1&q=select+*+from+cpu")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, error_body("authenticate failed"));

        // base64("user:secret")
        let req = request(Method::GET, "/query?db=db1&q=select+*+from+cpu")
            .header(AUTHORIZATION, "Basic dXNlcjpzZWNyZXQ=")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn admin_endpoints_need_the_token() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let (status, _, _) = call(
            &service,
            request(Method::GET, "/print").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = request(Method::GET, "/print")
            .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = call(&service, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], TEXT_CONTENT_TYPE);
        assert!(body.contains("mock backend h1\n"), "{body}");
        assert!(body.ends_with("route:db1.cpu,cluster:cl1\n"), "{body}");

        let req = request(Method::POST, "/print")
            .header(AUTHORIZATION, ADMIN)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = call(&service, req).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn switch_reload_and_debug() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);
        let check_id = fixture.registration().check_id;

        let (status, _, body) = call(&service, admin_request("/switch")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "");
        assert!(!service.is_available());
        assert_eq!(fixture.memory.check_status(&check_id), Some(CheckStatus::Critical));

        let (status, _, _) = call(&service, admin_request("/reload")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(service.is_available());
        assert_eq!(fixture.memory.check_status(&check_id), Some(CheckStatus::Passing));

        let (status, _, body) = call(&service, admin_request("/debug?operation=open")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "debug log open\n");
        assert!(service.log_filter().is_verbose());

        let (status, _, body) = call(&service, admin_request("/debug?operation=close")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "debug log close\n");
        assert!(!service.log_filter().is_verbose());

        let (status, _, body) = call(&service, admin_request("/debug")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "no operation found\n");
        service.shutdown().await;
    }

    #[test_log::test(tokio::test)]
    async fn metrics_count_requests() {
        let fixture = Fixture::new().await;
        let service = Arc::new(fixture.start().await);

        let req = request(Method::POST, "/write?db=db1")
            .body(Body::from("cpu,host=a v=1"))
            .unwrap();
        call(&service, req).await;

        let (status, headers, body) = call(
            &service,
            request(Method::GET, "/metrics").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
        assert!(
            body.contains(r#"influxdb_proxy_http_handled{code="204",db="db1",path="/write"} 1"#),
            "{body}"
        );
        assert!(body.contains("influxdb_proxy_available 1"), "{body}");
        service.shutdown().await;
    }

    #[derive(Debug)]
    struct Boom;

    #[async_trait]
    impl Middleware for Boom {
        async fn call(
            &self,
            _service: &ProxyService,
            _req: Request<Body>,
            _next: Next<'_>,
        ) -> Result<Response<Body>> {
            panic!("boom")
        }
    }

    #[test_log::test(tokio::test)]
    async fn panics_become_errors() {
        let fixture = Fixture::new().await;
        let service = fixture.start().await;

        let chain = Chain::default().with(Boom).with(Recover);
        let req = request(Method::GET, "/boom?db=db1").body(Body::empty()).unwrap();
        let error = chain
            .run(&service, "/boom", Handler::Metrics, req)
            .await
            .unwrap_err();
        assert_matches::assert_matches!(&error, Error::Panic(message) if message == "boom");
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            service
                .registry()
                .render_prometheus()
                .contains(r#"influxdb_proxy_http_panic{path="/boom"} 1"#)
        );
        service.shutdown().await;
    }

    #[test]
    fn db_from_query_or_header() {
        let req = request(Method::GET, "/query?db=+db1+&q=x").body(()).unwrap();
        assert_eq!(request_db(&req), "db1");
        let req = request(Method::POST, "/api/v2/query")
            .header("db", "db2")
            .body(())
            .unwrap();
        assert_eq!(request_db(&req), "db2");
        let req = request(Method::GET, "/query").body(()).unwrap();
        assert_eq!(request_db(&req), "");
    }

    #[test]
    fn content_type_follows_accept() {
        let mut headers = HeaderMap::new();
        assert_eq!(query_content_type(&headers), "application/json");
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        assert_eq!(query_content_type(&headers), "application/json");
        headers.insert(ACCEPT, HeaderValue::from_static("application/x-msgpack"));
        assert_eq!(query_content_type(&headers), "application/x-msgpack");
    }
}
