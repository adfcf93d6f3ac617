use proxy_clap_blocks::store::{ConfigStoreType, StoreConfig};
use proxy_config_store::ProxyStore;
use proxy_rebalance::Rebalancer;
use proxy_shutdown::BackgroundTasks;
use proxy_trogging::cli::LoggingConfig;
use thiserror::Error;

use super::common::consul_store;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("rebalance needs a shared config store, not an in-memory one")]
    MemoryStore,

    #[error("config store error: {0}")]
    Store(#[from] proxy_config_store::Error),

    #[error(transparent)]
    Rebalance(#[from] proxy_rebalance::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    store: StoreConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    if config.store.store_type == ConfigStoreType::Memory {
        return Err(Error::MemoryStore);
    }
    let store = ProxyStore::new(consul_store(&config.store)? as _, &config.store.consul_prefix)?;

    let tasks = BackgroundTasks::new();
    let report = Rebalancer::new(store, tasks.clone()).run().await;
    tasks.shutdown().await;

    let report = report?;
    if report.is_empty() {
        println!("every tag shard is in place");
    }
    for (cluster, keys) in &report.changed {
        println!("{cluster}: {}", keys.join(","));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;

    use super::*;

    #[tokio::test]
    async fn refuses_memory_store() {
        let config = Config::try_parse_from(["rebalance", "--config-store", "memory"]).unwrap();
        assert_matches!(command(config).await, Err(Error::MemoryStore));
    }
}
