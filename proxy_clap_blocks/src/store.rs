//! Config for the watched key/value store holding proxy configuration.

/// Which store implementation backs the proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigStoreType {
    /// A Consul agent reachable at `--consul-address`
    #[default]
    Consul,

    /// An in-process store, for single-node development
    Memory,
}

/// CLI config for the config store connection
#[derive(Debug, Clone, clap::Parser)]
pub struct StoreConfig {
    /// Which config store to use.
    #[clap(
        long = "config-store",
        env = "INFLUXDB_PROXY_CONFIG_STORE",
        default_value_t = ConfigStoreType::default(),
        value_enum,
        action
    )]
    pub store_type: ConfigStoreType,

    /// Base URL of the Consul agent.
    #[clap(
        long = "consul-address",
        env = "INFLUXDB_PROXY_CONSUL_ADDRESS",
        default_value = "http://127.0.0.1:8500",
        action
    )]
    pub consul_address: String,

    /// Key prefix under which all proxy configuration lives.
    #[clap(
        long = "consul-prefix",
        env = "INFLUXDB_PROXY_CONSUL_PREFIX",
        default_value = "influxdb_proxy",
        action
    )]
    pub consul_prefix: String,

    /// ACL token sent with every Consul request.
    #[clap(
        long = "consul-acl-token",
        env = "INFLUXDB_PROXY_CONSUL_ACL_TOKEN",
        action
    )]
    pub consul_acl_token: Option<String>,
}
