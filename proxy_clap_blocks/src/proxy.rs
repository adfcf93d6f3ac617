//! Config for the proxy HTTP service.
use crate::socket_addr::SocketAddr;

/// The default bind address for the HTTP API.
pub const DEFAULT_HTTP_BIND_ADDR: &str = "0.0.0.0:10201";

/// CLI config for request handling
#[derive(Debug, Clone, clap::Parser)]
pub struct ProxyConfig {
    /// The address on which the proxy serves HTTP API requests.
    #[clap(
        long = "http-bind",
        env = "INFLUXDB_PROXY_HTTP_BIND_ADDR",
        default_value = DEFAULT_HTTP_BIND_ADDR,
        action,
    )]
    pub http_bind_address: SocketAddr,

    /// Number of points handed to the router per parsed batch.
    #[clap(
        long = "batch-size",
        env = "INFLUXDB_PROXY_BATCH_SIZE",
        default_value = "100",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub batch_size: u64,

    /// Static token required by the administrative endpoints.
    ///
    /// When unset the administrative endpoints are disabled.
    #[clap(long = "auth-token", env = "INFLUXDB_PROXY_AUTH_TOKEN", action)]
    pub auth_token: Option<String>,

    /// Basic auth credentials, `username:password`, required by data endpoints when set.
    #[clap(long = "basic-auth", env = "INFLUXDB_PROXY_BASIC_AUTH", action)]
    pub basic_auth: Option<String>,

    /// Maximum size of an HTTP request body, after decompression.
    #[clap(
        long = "max-request-size",
        env = "INFLUXDB_PROXY_MAX_REQUEST_SIZE",
        default_value = "10485760",
        action
    )]
    pub max_request_size: usize,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_and_validation() {
        let config = ProxyConfig::try_parse_from(["proxy"]).unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.http_bind_address.port(), 10201);
        assert_eq!(config.max_request_size, 10 * 1024 * 1024);

        assert!(ProxyConfig::try_parse_from(["proxy", "--batch-size", "0"]).is_err());
    }
}
