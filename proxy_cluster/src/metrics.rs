use std::borrow::Cow;

use proxy_metric::{Attributes, Metric, Registry, U64Counter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Write,
    Query,
    RawQuery,
    CreateDatabase,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Query => "query",
            Self::RawQuery => "raw_query",
            Self::CreateDatabase => "create_db",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Received,
    Send,
    Success,
    Failed,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Send => "send",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn of<T, E>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(_) => Self::Failed,
        }
    }
}

/// Request counters of all clusters
#[derive(Debug, Clone)]
pub struct ClusterMetrics {
    requests: Metric<U64Counter>,
    backend_requests: Metric<U64Counter>,
}

impl ClusterMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests: registry.register_metric(
                "influxdb_proxy_cluster_request",
                "requests handled by a cluster",
            ),
            backend_requests: registry.register_metric(
                "influxdb_proxy_cluster_handled_backend",
                "requests a cluster sent to its backends",
            ),
        }
    }

    pub(crate) fn request(&self, cluster: &str, action: Action, outcome: Outcome, db: &str) {
        let attributes = Attributes::from([
            ("cluster", Cow::Owned(cluster.to_string())),
            ("action", Cow::Borrowed(action.as_str())),
            ("status", Cow::Borrowed(outcome.as_str())),
            ("db", Cow::Owned(db.to_string())),
        ]);
        self.requests.recorder(attributes).inc(1);
    }

    pub(crate) fn backend(
        &self,
        cluster: &str,
        backend: &str,
        action: Action,
        outcome: Outcome,
        db: &str,
    ) {
        let attributes = Attributes::from([
            ("cluster", Cow::Owned(cluster.to_string())),
            ("backend", Cow::Owned(backend.to_string())),
            ("action", Cow::Borrowed(action.as_str())),
            ("status", Cow::Borrowed(outcome.as_str())),
            ("db", Cow::Owned(db.to_string())),
        ]);
        self.backend_requests.recorder(attributes).inc(1);
    }
}
