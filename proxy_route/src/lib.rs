//! Table routing
//!
//! Every `db.table` route names the cluster holding the table and, for tables sharded by tag
//! values, the tag keys the shards are cut on. The [`RouteManager`] resolves requests against
//! those routes and runs them on the matching clusters.
use http::StatusCode;
use proxy_backend::BackupIsNil;
use thiserror::Error;

mod execution;
mod manager;

#[cfg(test)]
mod test_util;

pub use manager::{Route, RouteManager};

/// The cluster used when no route matches
pub const DEFAULT_CLUSTER: &str = "_default";

/// The table name of a database-wide route
pub const DEFAULT_TABLE: &str = "__default__";

/// Write fan-out across routes
pub const MAX_CONCURRENT_ROUTES: usize = 100;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty line")]
    EmptyData,

    #[error("get cluster failed")]
    GetClusterFailed,

    #[error("match cluster by route failed: {0}")]
    MatchClusterByRouteFailed(String),

    #[error("sql not supported")]
    SqlNotSupported,

    #[error("refresh routes failed")]
    RefreshFailed,

    #[error(transparent)]
    BackupIsNil(#[from] BackupIsNil),

    #[error(transparent)]
    Parse(#[from] proxy_line_protocol::Error),

    #[error(transparent)]
    Statement(#[from] proxy_influxql::Error),

    #[error(transparent)]
    Cluster(#[from] proxy_cluster::Error),

    #[error("failed to read the config store: {0}")]
    Store(#[from] proxy_config_store::Error),
}

impl Error {
    /// The status answered to the client when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EmptyData
            | Self::GetClusterFailed
            | Self::SqlNotSupported
            | Self::Parse(_)
            | Self::Statement(_) => StatusCode::BAD_REQUEST,
            Self::Cluster(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::MatchClusterByRouteFailed(_)
            | Self::RefreshFailed
            | Self::BackupIsNil(_)
            | Self::Cluster(_)
            | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The route key of `table` in `db`
pub fn route_key(db: &str, table: &str) -> String {
    format!("{db}.{table}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(Error::EmptyData.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::Cluster(proxy_cluster::Error::MissingRequiredDimensions).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Cluster(proxy_cluster::Error::NoAvailableBackend("c1".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::MatchClusterByRouteFailed("db.t".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
