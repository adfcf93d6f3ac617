//! Entrypoint for the proxy server
use std::{sync::Arc, time::Duration};

use hyper::server::conn::AddrIncoming;
use parking_lot::Mutex;
use proxy_backend::HttpBackendFactory;
use proxy_clap_blocks::{
    health::HealthConfig,
    proxy::ProxyConfig,
    store::{ConfigStoreType, StoreConfig},
};
use proxy_config_store::{ConfigStore, HealthCheck, MemoryStore, ServiceRegistration};
use proxy_metric::Registry;
use proxy_server::{BasicCredentials, ConfigSource, HealthSettings, ProxyService, ServiceConfig};
use proxy_shutdown::{ShutdownManager, wait_for_signal};
use proxy_trogging::{LogFilterHandle, cli::LoggingConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::common::consul_store;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("cannot bind to {addr}: {source}")]
    BindAddress {
        addr: std::net::SocketAddr,
        source: hyper::Error,
    },

    #[error(transparent)]
    Server(#[from] proxy_server::Error),

    #[error("error serving http: {0}")]
    ServingHttp(#[from] hyper::Error),

    #[error("http server task failed: {0}")]
    ServerTask(#[from] tokio::task::JoinError),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, clap::Parser)]
pub(crate) struct Config {
    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    proxy: ProxyConfig,

    #[clap(flatten)]
    store: StoreConfig,

    #[clap(flatten)]
    health: HealthConfig,

    /// Timeout of a single request to a backend.
    #[clap(
        long = "backend-timeout",
        env = "INFLUXDB_PROXY_BACKEND_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    backend_timeout: Duration,

    /// How often backends taken out of the query rotation are pinged.
    #[clap(
        long = "probe-interval",
        env = "INFLUXDB_PROXY_PROBE_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    probe_interval: Duration,

    /// How long startup or a reload waits for the config store to deliver the configuration.
    #[clap(
        long = "config-load-timeout",
        env = "INFLUXDB_PROXY_CONFIG_LOAD_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    load_timeout: Duration,
}

/// Parses the `serve` configuration again on reload
pub(crate) type Reparse = fn() -> Result<Config, String>;

/// Builds each generation's configuration from the command line and the environment
///
/// The first load answers the configuration the process started with; later loads parse it
/// again. An in-memory store is kept across reloads.
#[derive(Debug)]
struct EnvConfigSource {
    initial: Mutex<Option<Config>>,
    reparse: Reparse,
    memory: Arc<MemoryStore>,
}

impl EnvConfigSource {
    fn new(config: Config, reparse: Reparse) -> Self {
        Self {
            initial: Mutex::new(Some(config)),
            reparse,
            memory: Arc::new(MemoryStore::new()),
        }
    }

    fn service_config(&self, config: &Config) -> proxy_server::Result<ServiceConfig> {
        let (store, check): (Arc<dyn ConfigStore>, Arc<dyn HealthCheck>) =
            match config.store.store_type {
                ConfigStoreType::Consul => {
                    let consul = consul_store(&config.store)?;
                    (Arc::clone(&consul) as _, consul as _)
                }
                ConfigStoreType::Memory => {
                    (Arc::clone(&self.memory) as _, Arc::clone(&self.memory) as _)
                }
            };

        let basic_auth = config
            .proxy
            .basic_auth
            .as_deref()
            .map(str::parse::<BasicCredentials>)
            .transpose()
            .map_err(proxy_server::Error::Config)?;

        let bind = *config.proxy.http_bind_address;
        let address = config
            .health
            .advertise_address
            .clone()
            .unwrap_or_else(|| bind.ip().to_string());
        let registration = ServiceRegistration::new(
            config.health.service_name.as_str(),
            address,
            bind.port(),
            config.health.period,
        );

        Ok(ServiceConfig {
            store,
            prefix: config.store.consul_prefix.clone(),
            backends: Arc::new(HttpBackendFactory::new(config.backend_timeout)),
            batch_size: usize::try_from(config.proxy.batch_size).unwrap_or(usize::MAX),
            max_request_size: config.proxy.max_request_size,
            auth_token: config.proxy.auth_token.clone(),
            basic_auth,
            health: Some(HealthSettings {
                check,
                registration,
                heartbeat: config.health.heartbeat_interval(),
            }),
            probe_interval: config.probe_interval,
            load_timeout: config.load_timeout,
        })
    }
}

impl ConfigSource for EnvConfigSource {
    fn load(&self) -> proxy_server::Result<ServiceConfig> {
        let initial = self.initial.lock().take();
        let config = match initial {
            Some(config) => config,
            None => (self.reparse)().map_err(proxy_server::Error::Config)?,
        };
        self.service_config(&config)
    }
}

pub(crate) async fn command(
    config: Config,
    log_filter: LogFilterHandle,
    reparse: Reparse,
) -> Result<()> {
    let bind = *config.proxy.http_bind_address;
    let source = Arc::new(EnvConfigSource::new(config, reparse));
    let registry = Arc::new(Registry::new());
    let service = Arc::new(ProxyService::start(source, registry, log_filter).await?);

    let incoming = AddrIncoming::bind(&bind).map_err(|source| Error::BindAddress {
        addr: bind,
        source,
    })?;
    info!(address = %incoming.local_addr(), "listening for HTTP requests");

    // the frontend stops accepting requests only after the service has wound down
    let frontend_shutdown = CancellationToken::new();
    let shutdown_manager = ShutdownManager::new(frontend_shutdown.clone());
    let service_token = shutdown_manager.register();
    tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            service_token.wait_for_shutdown().await;
            service.shutdown().await;
            service_token.complete();
        }
    });

    let mut server = tokio::spawn(proxy_server::serve(
        incoming,
        Arc::clone(&service),
        frontend_shutdown,
    ));

    let early_exit = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut server => Some(result),
    };
    info!("shutting down the proxy");
    shutdown_manager.shutdown();
    shutdown_manager.join().await;

    let result = match early_exit {
        Some(result) => result,
        None => server.await,
    };
    match result {
        Ok(Ok(())) => {
            info!("proxy stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "http server failed");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(["serve", "--config-store", "memory"].iter().chain(args).copied())
            .unwrap()
    }

    fn reparse_fails() -> Result<Config, String> {
        Err("no command line".to_string())
    }

    #[test]
    fn builds_service_config() {
        let config = parse(&[
            "--http-bind",
            "127.0.0.1:10222",
            "--batch-size",
            "500",
            "--auth-token",
            "secret",
            "--basic-auth",
            "user:pass",
            "--health-period",
            "15s",
        ]);
        let source = EnvConfigSource::new(config, reparse_fails);
        let service = source.load().unwrap();

        assert_eq!(service.batch_size, 500);
        assert_eq!(service.prefix, "influxdb_proxy");
        assert_eq!(service.auth_token.as_deref(), Some("secret"));
        assert!(service.basic_auth.is_some());
        let health = service.health.unwrap();
        assert_eq!(health.registration.check_id, "127.0.0.1:10222");
        assert_eq!(health.heartbeat, Duration::from_secs(5));
        assert_eq!(service.load_timeout, Duration::from_secs(30));

        // later loads parse the command line again
        assert_matches!(source.load(), Err(proxy_server::Error::Config(e)) if e == "no command line");
    }

    #[test]
    fn rejects_malformed_basic_auth() {
        let source = EnvConfigSource::new(parse(&["--basic-auth", "nopassword"]), reparse_fails);
        assert_matches!(source.load(), Err(proxy_server::Error::Config(_)));
    }

    #[test]
    fn memory_store_survives_reloads() {
        fn reparse() -> Result<Config, String> {
            Config::try_parse_from(["serve", "--config-store", "memory"]).map_err(|e| e.to_string())
        }
        let source = EnvConfigSource::new(parse(&[]), reparse);
        let first = source.load().unwrap();
        let second = source.load().unwrap();
        assert!(Arc::ptr_eq(&first.store, &second.store));
    }
}
