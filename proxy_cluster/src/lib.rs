//! Named groups of InfluxDB backends
//!
//! A [`Cluster`] fans writes out to its backends and balances queries across them. Routes that
//! are sharded by tag values place each shard on a subset of the cluster's hosts, as recorded
//! in the `tag_info` records the [`TagInfoManager`] follows. The [`ClusterManager`] keeps the
//! clusters in step with the `cluster_info` records of the config store.
use std::{fmt::Debug, sync::Arc};

use proxy_backend::BackupIsNil;
use thiserror::Error;

mod balance;
mod cluster;
mod info;
mod jumphash;
mod manager;
mod metrics;
mod tag;

#[cfg(test)]
mod test_util;

pub use cluster::{Cluster, ClusterContext};
pub use jumphash::JumpHash;
pub use manager::ClusterManager;
pub use metrics::ClusterMetrics;
pub use tag::{DEFAULT_REPLICAS, TagInfoManager, read_hosts, tag_key, write_hosts};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cluster not exist: {0}")]
    ClusterNotExist(String),

    #[error("refresh clusters failed")]
    RefreshFailed,

    #[error(transparent)]
    BackupIsNil(#[from] BackupIsNil),

    #[error(transparent)]
    Backend(#[from] proxy_backend::Error),

    #[error("failed to read tag info from the config store: {0}")]
    Store(#[from] proxy_config_store::Error),

    #[error("write into cluster {cluster} failed: {source}")]
    WriteFailed {
        cluster: String,
        #[source]
        source: proxy_backend::Error,
    },

    #[error("query in cluster {cluster} failed: {source}")]
    QueryFailed {
        cluster: String,
        #[source]
        source: proxy_backend::Error,
    },

    #[error("create database in cluster {cluster} failed: {source}")]
    CreateDatabaseFailed {
        cluster: String,
        #[source]
        source: proxy_backend::Error,
    },

    #[error("influxdb cluster: [{0}] has no available backend")]
    NoAvailableBackend(String),

    #[error("get tag value failed: {0}")]
    GetTagValueFailed(#[source] proxy_influxql::Error),

    #[error("missing required dimensions")]
    MissingRequiredDimensions,

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("invalid query info response {body:?}: {source}")]
    InvalidQueryInfo {
        body: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// `true` if the request itself was at fault rather than the cluster
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::GetTagValueFailed(_) | Self::MissingRequiredDimensions | Self::InvalidDimensions(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resolves cluster names to clusters
pub trait ClusterLookup: Debug + Send + Sync + 'static {
    fn get_cluster(&self, name: &str) -> Result<Arc<Cluster>>;
}
