//! Typed access to the watched key/value store that replicates proxy configuration
//!
//! Every proxy instance reads its topology (hosts, clusters, routes and tag shards) from the
//! store and watches it for changes. The [`ConfigStore`] trait is the raw key/value surface;
//! [`ProxyStore`] layers the key layout and the JSON records on top of it.
use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};

mod consul;
mod health;
mod memory;
mod model;
mod session;
mod store;
mod watch;

pub use consul::ConsulStore;
pub use health::{CheckStatus, HealthCheck, ServiceRegistration};
pub use memory::MemoryStore;
pub use model::{ClusterInfo, HostInfo, RouteInfo, TagInfo, TagRecord, TagStatus};
pub use session::{DistributedLock, spawn_session_renewal};
pub use store::{
    CLUSTER_INFO_PATH, HOST_INFO_PATH, LOCK_PATH, ProxyStore, ROUTE_PATH, TAG_INFO_PATH,
    VERSION_PATH,
};
pub use watch::{CHANGED_SENTINEL, content_hash, sort_pairs, watch_change};

/// Primary error type for store access
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("request URL error: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse JSON response: {0}")]
    Json(#[source] reqwest::Error),

    #[error("failed to parse plaintext response: {0}")]
    Text(#[source] reqwest::Error),

    #[error("store responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("store response is missing the change index header")]
    MissingIndex,

    #[error("value at '{key}' is not valid base64: {source}")]
    Base64 {
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("failed to decode {kind} at '{key}': {source}")]
    Decode {
        kind: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("session '{0}' does not exist")]
    SessionNotFound(String),

    #[error("store key prefix must not be empty")]
    EmptyPrefix,

    #[error("store is unavailable")]
    Unavailable,
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single key and its raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Bytes,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Raw access to the watched key/value store
///
/// Paths are absolute within the store; callers that work under a prefix use [`ProxyStore`].
#[async_trait]
pub trait ConfigStore: Debug + Send + Sync + 'static {
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    /// All pairs under `prefix`, ordered by key
    ///
    /// A `/` separator is appended to the prefix if it does not already end with one.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// The direct children of `prefix`, each ending in `/` when it has children of its own
    async fn get_child(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put(&self, path: &str, value: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Write `value` only if the key still holds `previous`
    ///
    /// With `previous == None` the write only succeeds if the key does not exist yet. Returns
    /// `false` when the stored value no longer matches.
    async fn cas(&self, path: &str, previous: Option<&[u8]>, value: Bytes) -> Result<bool>;

    /// Create a session that expires after `ttl` unless renewed
    async fn new_session(&self, ttl: Duration) -> Result<String>;

    async fn renew_session(&self, session: &str) -> Result<()>;

    /// Take the lock at `path` for `session`, returning `false` if another session holds it
    async fn acquire(&self, path: &str, session: &str) -> Result<bool>;

    async fn release(&self, path: &str, session: &str) -> Result<bool>;

    /// Wait until any key starting with `prefix` changed after `index` and return the new index
    ///
    /// The prefix is matched as given, so it also watches a single key. An `index` of zero
    /// returns immediately with the current index.
    async fn wait_for_change(&self, prefix: &str, index: u64) -> Result<u64>;
}

pub(crate) fn format_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}
