//! Connections to the InfluxDB hosts behind the proxy
//!
//! A [`Backend`] is one database host. Backends are owned by the [`BackendManager`], which keeps
//! them in step with the `host_info` records of the config store; clusters look them up by host
//! name through the [`BackendRegistry`] trait.
use std::{
    borrow::Cow,
    fmt::{Debug, Display},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use proxy_config_store::HostInfo;
use thiserror::Error;

mod influxdb;
mod manager;
pub mod mock;
mod snapshot;

pub use influxdb::HttpBackend;
pub use manager::{BackendFactory, BackendManager, HttpBackendFactory};
pub use snapshot::{BackupIsNil, Snapshot};

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend {backend} unreachable: {message}")]
    Network { backend: String, message: String },

    #[error("failed to read the response of backend {backend}: {message}")]
    ReadBody { backend: String, message: String },

    #[error("invalid address {address} for backend {backend}: {source}")]
    InvalidAddress {
        backend: String,
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("backend {backend} answered ping with status {status}")]
    Ping { backend: String, status: StatusCode },

    #[error("backend not exist: {}", .0.join(","))]
    BackendNotExist(Vec<String>),

    #[error("refresh backends failed")]
    RefreshFailed,

    #[error(transparent)]
    BackupIsNil(#[from] BackupIsNil),

    #[error("failed to read hosts from the config store: {0}")]
    Store(#[from] proxy_config_store::Error),
}

impl Error {
    /// `true` for failures after which another host of the same cluster should be tried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::ReadBody { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// URL parameters of a write, empty strings are not sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteParams {
    pub db: String,
    pub consistency: String,
    pub precision: String,
    pub rp: String,
}

impl WriteParams {
    pub fn new(db: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            ..Default::default()
        }
    }
}

/// URL parameters of a query, empty strings are not sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub db: String,
    pub sql: String,
    pub epoch: String,
    pub pretty: String,
    pub chunked: String,
    pub chunk_size: String,
}

impl QueryParams {
    pub fn new(db: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// A response relayed from a backend
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status:{},body:{}", self.status, self.body_str())
    }
}

/// One InfluxDB host
#[async_trait]
pub trait Backend: Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Disabled backends are left out of every cluster
    fn disabled(&self) -> bool;

    /// `false` while the host is known to be unreachable for queries
    fn readable(&self) -> bool;

    /// Apply changed connection settings in place
    fn reset(&self, info: &HostInfo) -> Result<()>;

    /// A one line description for diagnostics
    fn describe(&self) -> String;

    async fn write(&self, params: &WriteParams, body: Bytes, headers: &HeaderMap)
    -> Result<Response>;

    async fn query(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response>;

    async fn create_database(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response>;

    /// Forward a Flux query unchanged
    async fn raw_query(&self, body: Bytes, headers: &HeaderMap) -> Result<Response>;

    /// Check the host is alive, marking it readable again on success
    ///
    /// Returns the version the host reports, if any.
    async fn ping(&self) -> Result<Option<String>>;
}

/// Resolves host names to backends
pub trait BackendRegistry: Debug + Send + Sync + 'static {
    /// The backends for `names`, in order, leaving out disabled ones
    ///
    /// Fails with [`Error::BackendNotExist`] naming every unknown host.
    fn backends(&self, names: &[String]) -> Result<Vec<Arc<dyn Backend>>>;
}
