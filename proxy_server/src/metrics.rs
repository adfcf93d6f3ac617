use std::borrow::Cow;

use http::StatusCode;
use proxy_metric::{Attributes, Metric, Registry, U64Counter, U64Gauge};

/// Metrics of the HTTP surface and of the proxy lifecycle
#[derive(Debug, Clone)]
pub(crate) struct HttpMetrics {
    received: Metric<U64Counter>,
    handled: Metric<U64Counter>,
    panics: Metric<U64Counter>,
    refreshes: Metric<U64Counter>,
    available: Metric<U64Gauge>,
    start_time: Metric<U64Gauge>,
    reload_time: Metric<U64Gauge>,
}

impl HttpMetrics {
    pub(crate) fn new(registry: &Registry) -> Self {
        Self {
            received: registry.register_metric(
                "influxdb_proxy_http_received",
                "requests received per endpoint and database",
            ),
            handled: registry.register_metric(
                "influxdb_proxy_http_handled",
                "requests answered per endpoint, database and status",
            ),
            panics: registry.register_metric(
                "influxdb_proxy_http_panic",
                "requests aborted by a panic",
            ),
            refreshes: registry.register_metric(
                "influxdb_proxy_refresh",
                "configuration refreshes by outcome",
            ),
            available: registry.register_metric(
                "influxdb_proxy_available",
                "1 while the proxy serves traffic",
            ),
            start_time: registry.register_metric(
                "influxdb_proxy_start_time_seconds",
                "unix time the proxy started",
            ),
            reload_time: registry.register_metric(
                "influxdb_proxy_reload_time_seconds",
                "unix time of the last successful reload",
            ),
        }
    }

    pub(crate) fn received(&self, path: &'static str, db: &str) {
        self.received
            .recorder([
                ("path", Cow::Borrowed(path)),
                ("db", Cow::Owned(db.to_string())),
            ])
            .inc(1);
    }

    pub(crate) fn handled(&self, path: &'static str, db: &str, status: StatusCode) {
        self.handled
            .recorder([
                ("path", Cow::Borrowed(path)),
                ("db", Cow::Owned(db.to_string())),
                ("code", Cow::Owned(status.as_u16().to_string())),
            ])
            .inc(1);
    }

    pub(crate) fn panic(&self, path: &'static str) {
        self.panics.recorder([("path", Cow::Borrowed(path))]).inc(1);
    }

    pub(crate) fn refresh(&self, success: bool) {
        let status = if success { "success" } else { "failed" };
        self.refreshes
            .recorder([("status", Cow::Borrowed(status))])
            .inc(1);
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available
            .recorder(Attributes::default())
            .set(u64::from(available));
    }

    pub(crate) fn started(&self, unix_seconds: u64) {
        self.start_time.recorder(Attributes::default()).set(unix_seconds);
    }

    pub(crate) fn reloaded(&self, unix_seconds: u64) {
        self.reload_time.recorder(Attributes::default()).set(unix_seconds);
    }
}
