//! Config for registering the proxy in the service catalog.
use std::time::Duration;

/// CLI config for service registration and the TTL health check
#[derive(Debug, Clone, clap::Parser)]
pub struct HealthConfig {
    /// Service name the proxy registers under.
    #[clap(
        long = "health-service-name",
        env = "INFLUXDB_PROXY_HEALTH_SERVICE_NAME",
        default_value = "influxdb_proxy",
        action
    )]
    pub service_name: String,

    /// TTL of the health check. Heartbeats are sent every third of it.
    #[clap(
        long = "health-period",
        env = "INFLUXDB_PROXY_HEALTH_PERIOD",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub period: Duration,

    /// Address advertised to the catalog, the bind address' IP when unset.
    #[clap(
        long = "health-advertise-address",
        env = "INFLUXDB_PROXY_HEALTH_ADVERTISE_ADDRESS",
        action
    )]
    pub advertise_address: Option<String>,
}

impl HealthConfig {
    /// The heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        (self.period / 3).max(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn heartbeat_is_a_third_of_the_period() {
        let config = HealthConfig::try_parse_from(["proxy", "--health-period", "1m"]).unwrap();
        assert_eq!(config.period, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(config.service_name, "influxdb_proxy");
    }
}
