//! A [`ConfigStore`] backed by the Consul HTTP API
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use reqwest::{IntoUrl, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
    ConfigStore, Error, KvPair, Result, format_prefix,
    health::{CheckStatus, HealthCheck, ServiceRegistration},
};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// How long a blocking query is held open by the server before it returns unchanged
const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_secs(60);

/// Client for a Consul agent
#[derive(Debug, Clone)]
pub struct ConsulStore {
    base_url: Url,
    acl_token: Option<Secret<String>>,
    blocking_wait: Duration,
    http_client: reqwest::Client,
}

impl ConsulStore {
    /// Create a new [`ConsulStore`] talking to the agent at `base_url`
    pub fn new<U: IntoUrl>(base_url: U) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into_url().map_err(Error::BaseUrl)?,
            acl_token: None,
            blocking_wait: DEFAULT_BLOCKING_WAIT,
            http_client: reqwest::Client::new(),
        })
    }

    /// Send the given ACL token with every request
    pub fn with_acl_token<S: Into<String>>(mut self, token: S) -> Self {
        self.acl_token = Some(Secret::new(token.into()));
        self
    }

    /// Override how long blocking queries wait for a change
    pub fn with_blocking_wait(mut self, wait: Duration) -> Self {
        self.blocking_wait = wait;
        self
    }

    fn request(&self, method: Method, path: &str) -> Result<(RequestBuilder, String)> {
        let url = self.base_url.join(path)?;
        let display = url.to_string();
        let mut req = self.http_client.request(method, url);
        if let Some(token) = &self.acl_token {
            req = req.header(TOKEN_HEADER, token.expose_secret());
        }
        Ok((req, display))
    }

    async fn send(&self, method: Method, path: &str, query: &[(&str, &str)]) -> Result<Response> {
        self.send_body(method, path, query, Bytes::new()).await
    }

    async fn send_body(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Bytes,
    ) -> Result<Response> {
        let (req, url) = self.request(method.clone(), path)?;
        req.query(query)
            .body(body)
            .send()
            .await
            .map_err(|src| Error::request_send(method, url, src))
    }

    async fn send_json<T: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &T,
    ) -> Result<Response> {
        let (req, url) = self.request(method.clone(), path)?;
        req.json(body)
            .send()
            .await
            .map_err(|src| Error::request_send(method, url, src))
    }

    /// Read the entries at a KV path, returning `None` on 404
    async fn read_entries(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<Vec<KvEntry>>> {
        let resp = self
            .send(Method::GET, &kv_path(path), query)
            .await?;
        match resp.status() {
            StatusCode::OK => resp.json().await.map(Some).map_err(Error::Json),
            StatusCode::NOT_FOUND => Ok(None),
            code => Err(api_error(code, resp).await),
        }
    }

    async fn read_entry(&self, path: &str) -> Result<Option<KvEntry>> {
        Ok(self
            .read_entries(path, &[])
            .await?
            .and_then(|entries| entries.into_iter().next()))
    }

    /// PUT to a KV path and parse the boolean the server answers with
    async fn put_kv(&self, path: &str, query: &[(&str, &str)], value: Bytes) -> Result<bool> {
        let resp = self
            .send_body(Method::PUT, &kv_path(path), query, value)
            .await?;
        parse_bool(resp).await
    }
}

#[async_trait]
impl ConfigStore for ConsulStore {
    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        match self.read_entry(path).await? {
            Some(entry) => Ok(Some(entry.decode()?.value)),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let prefix = format_prefix(prefix);
        let mut pairs = self
            .read_entries(&prefix, &[("recurse", "true")])
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(KvEntry::decode)
            .collect::<Result<Vec<_>>>()?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn get_child(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = format_prefix(prefix);
        let resp = self
            .send(
                Method::GET,
                &kv_path(&prefix),
                &[("keys", "true"), ("separator", "/")],
            )
            .await?;
        match resp.status() {
            StatusCode::OK => resp.json().await.map_err(Error::Json),
            StatusCode::NOT_FOUND => Ok(vec![]),
            code => Err(api_error(code, resp).await),
        }
    }

    async fn put(&self, path: &str, value: Bytes) -> Result<()> {
        self.put_kv(path, &[], value).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.send(Method::DELETE, &kv_path(path), &[]).await?;
        match resp.status() {
            code if code.is_success() => Ok(()),
            code => Err(api_error(code, resp).await),
        }
    }

    async fn cas(&self, path: &str, previous: Option<&[u8]>, value: Bytes) -> Result<bool> {
        let index = match previous {
            None => 0,
            Some(previous) => match self.read_entry(path).await? {
                Some(entry) => {
                    let modify_index = entry.modify_index;
                    if entry.decode()?.value.as_ref() != previous {
                        return Ok(false);
                    }
                    modify_index
                }
                // the key vanished since the caller read it; only recreate it
                None => 0,
            },
        };
        let index = index.to_string();
        self.put_kv(path, &[("cas", index.as_str())], value).await
    }

    async fn new_session(&self, ttl: Duration) -> Result<String> {
        let request = SessionRequest {
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "release",
            lock_delay: "0s",
        };
        let resp = self
            .send_json(Method::PUT, "/v1/session/create", &request)
            .await?;
        match resp.status() {
            StatusCode::OK => {
                let created: SessionCreated = resp.json().await.map_err(Error::Json)?;
                debug!(session = %created.id, "created store session");
                Ok(created.id)
            }
            code => Err(api_error(code, resp).await),
        }
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        let resp = self
            .send(Method::PUT, &format!("/v1/session/renew/{session}"), &[])
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::SessionNotFound(session.to_string())),
            code => Err(api_error(code, resp).await),
        }
    }

    async fn acquire(&self, path: &str, session: &str) -> Result<bool> {
        self.put_kv(path, &[("acquire", session)], Bytes::new())
            .await
    }

    async fn release(&self, path: &str, session: &str) -> Result<bool> {
        self.put_kv(path, &[("release", session)], Bytes::new())
            .await
    }

    async fn wait_for_change(&self, prefix: &str, index: u64) -> Result<u64> {
        let wait = format!("{}s", self.blocking_wait.as_secs().max(1));
        let mut index = index;
        loop {
            let index_param = index.to_string();
            let resp = self
                .send(
                    Method::GET,
                    &kv_path(prefix),
                    &[
                        ("recurse", "true"),
                        ("index", index_param.as_str()),
                        ("wait", wait.as_str()),
                    ],
                )
                .await?;
            let status = resp.status();
            if !(status == StatusCode::OK || status == StatusCode::NOT_FOUND) {
                return Err(api_error(status, resp).await);
            }
            let new_index = resp
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(Error::MissingIndex)?;

            // an index going backwards means the server state was reset, which counts as a change
            if new_index != index || index == 0 {
                return Ok(new_index);
            }
            debug!(%prefix, index, "blocking query timed out without a change");
            index = new_index;
        }
    }
}

#[async_trait]
impl HealthCheck for ConsulStore {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        let body = ServiceBody {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
        };
        let resp = self
            .send_json(Method::PUT, "/v1/agent/service/register", &body)
            .await?;
        expect_success(resp).await
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let resp = self
            .send(
                Method::PUT,
                &format!("/v1/agent/service/deregister/{service_id}"),
                &[],
            )
            .await?;
        expect_success(resp).await
    }

    async fn register_check(&self, registration: &ServiceRegistration) -> Result<()> {
        let body = CheckBody {
            id: &registration.check_id,
            name: &registration.check_id,
            ttl: format!("{}s", registration.ttl.as_secs().max(1)),
            service_id: &registration.id,
        };
        let resp = self
            .send_json(Method::PUT, "/v1/agent/check/register", &body)
            .await?;
        expect_success(resp).await
    }

    async fn update_check(&self, check_id: &str, status: CheckStatus) -> Result<()> {
        let verb = match status {
            CheckStatus::Passing => "pass",
            CheckStatus::Critical => "fail",
        };
        let resp = self
            .send(
                Method::PUT,
                &format!("/v1/agent/check/{verb}/{check_id}"),
                &[],
            )
            .await?;
        expect_success(resp).await
    }
}

fn kv_path(path: &str) -> String {
    format!("/v1/kv/{}", path.trim_start_matches('/'))
}

async fn api_error(code: StatusCode, resp: Response) -> Error {
    match resp.text().await {
        Ok(message) => Error::ApiError { code, message },
        Err(e) => Error::Text(e),
    }
}

async fn expect_success(resp: Response) -> Result<()> {
    match resp.status() {
        code if code.is_success() => Ok(()),
        code => Err(api_error(code, resp).await),
    }
}

async fn parse_bool(resp: Response) -> Result<bool> {
    match resp.status() {
        StatusCode::OK => {
            let text = resp.text().await.map_err(Error::Text)?;
            Ok(text.trim() == "true")
        }
        code => Err(api_error(code, resp).await),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

impl KvEntry {
    fn decode(self) -> Result<KvPair> {
        let value = match self.value {
            Some(encoded) => STANDARD.decode(encoded).map_err(|source| Error::Base64 {
                key: self.key.clone(),
                source,
            })?,
            None => vec![],
        };
        Ok(KvPair::new(self.key, value))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    lock_delay: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
}
