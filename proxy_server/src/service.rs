use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::RwLock;
use proxy_backend::{BackendFactory, BackendManager};
use proxy_cluster::{ClusterContext, ClusterManager, ClusterMetrics};
use proxy_config_store::{ConfigStore, HealthCheck, ProxyStore, ServiceRegistration};
use proxy_metric::Registry;
use proxy_route::RouteManager;
use proxy_shutdown::BackgroundTasks;
use proxy_trogging::LogFilterHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    BasicCredentials, Error, Result,
    auth::AdminToken,
    handlers::{Endpoint, endpoints},
    metrics::HttpMetrics,
};

/// Reads the static configuration, at startup and again on every reload
pub trait ConfigSource: Debug + Send + Sync + 'static {
    fn load(&self) -> Result<ServiceConfig>;
}

/// Registration of the proxy in the service catalog
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub check: Arc<dyn HealthCheck>,
    pub registration: ServiceRegistration,
    /// Interval of the passing heartbeat while the proxy is available
    pub heartbeat: Duration,
}

/// Everything one generation of the proxy is built from
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store: Arc<dyn ConfigStore>,
    pub prefix: String,
    pub backends: Arc<dyn BackendFactory>,
    pub batch_size: usize,
    pub max_request_size: usize,
    /// Token of the administrative endpoints, which are closed without one
    pub auth_token: Option<String>,
    /// Credentials data endpoints require, open without
    pub basic_auth: Option<BasicCredentials>,
    pub health: Option<HealthSettings>,
    /// How often unreachable backends are pinged
    pub probe_interval: Duration,
    /// How long a new generation waits for the store to deliver the first config
    pub load_timeout: Duration,
}

/// The managers built from one [`ServiceConfig`] and the tasks keeping them current
#[derive(Debug)]
pub(crate) struct Generation {
    pub(crate) config: ServiceConfig,
    pub(crate) admin_token: AdminToken,
    pub(crate) store: ProxyStore,
    pub(crate) backends: Arc<BackendManager>,
    pub(crate) clusters: Arc<ClusterManager>,
    pub(crate) routes: Arc<RouteManager>,
    pub(crate) tasks: BackgroundTasks,
}

impl Generation {
    fn new(config: ServiceConfig, registry: &Registry) -> Result<Self> {
        let store = ProxyStore::new(Arc::clone(&config.store), &config.prefix)?;
        let tasks = BackgroundTasks::new();
        let backends = Arc::new(BackendManager::new(Arc::clone(&config.backends)));
        let clusters = Arc::new(ClusterManager::new(ClusterContext {
            registry: Arc::clone(&backends) as _,
            store: store.clone(),
            tasks: tasks.clone(),
            metrics: ClusterMetrics::new(registry),
        }));
        let routes = Arc::new(RouteManager::new(
            Arc::clone(&clusters) as _,
            store.clone(),
            config.batch_size,
        ));
        Ok(Self {
            admin_token: AdminToken::new(config.auth_token.clone()),
            config,
            store,
            backends,
            clusters,
            routes,
            tasks,
        })
    }

    fn backup(&self) {
        self.backends.backup();
        self.clusters.backup();
        self.routes.backup();
    }

    fn recover(&self) -> Result<()> {
        self.backends.recover()?;
        self.clusters.recover()?;
        self.routes.recover()?;
        Ok(())
    }

    /// Hosts first, then the clusters built on them, then the routes onto clusters
    async fn refresh(&self) -> Result<()> {
        self.backends.refresh_from_store(&self.store).await?;
        self.clusters.refresh_from_store().await?;
        self.routes.refresh_from_store().await?;
        Ok(())
    }
}

/// State shared between request handlers and background tasks across generations
#[derive(Debug)]
struct Shared {
    /// Shared by traffic, exclusive for administration and refreshes
    gate: tokio::sync::RwLock<()>,
    available: AtomicBool,
    metrics: HttpMetrics,
}

impl Shared {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Flip availability and report it to the health check
    async fn set_available(
        &self,
        generation: &Generation,
        available: bool,
    ) -> Result<(), proxy_config_store::Error> {
        self.available.store(available, Ordering::SeqCst);
        self.metrics.set_available(available);
        let Some(health) = &generation.config.health else {
            return Ok(());
        };
        let check_id = &health.registration.check_id;
        if available {
            health.check.check_pass(check_id).await
        } else {
            health.check.check_fail(check_id).await
        }
    }

    /// Reload every manager from the store, leaving the proxy unavailable on failure
    ///
    /// Callers hold the gate exclusively or serve no traffic yet.
    async fn refresh_all(&self, generation: &Generation) -> Result<()> {
        info!("refreshing all managers");
        if let Err(error) = self.set_available(generation, false).await {
            warn!(%error, "failed to report unavailability, registering health check again");
            if let Some(health) = &generation.config.health
                && let Err(error) = register_health(health).await
            {
                error!(%error, "health check registration failed");
            }
        }

        let result = generation.refresh().await;
        self.metrics.refresh(result.is_ok());
        result?;

        if let Err(error) = self.set_available(generation, true).await {
            warn!(%error, "failed to report availability");
        }
        info!("refresh all managers successful");
        Ok(())
    }

    /// Refresh on every new config hash until the generation ends
    async fn watch(
        self: Arc<Self>,
        generation: Arc<Generation>,
        mut changes: mpsc::Receiver<String>,
        mut current: String,
    ) {
        let token = generation.tasks.cancellation_token();
        loop {
            let hash = tokio::select! {
                _ = token.cancelled() => break,
                hash = changes.recv() => match hash {
                    Some(hash) => hash,
                    None => break,
                },
            };
            if hash == current {
                debug!(%hash, "config unchanged");
                continue;
            }

            info!(%hash, "config changed, refreshing");
            let _guard = tokio::select! {
                _ = token.cancelled() => break,
                guard = self.gate.write() => guard,
            };
            generation.backup();
            match self.refresh_all(&generation).await {
                Ok(()) => {
                    info!(%hash, "refresh successful");
                    current = hash;
                }
                Err(error) => {
                    error!(%error, "refresh failed, recovering the previous config");
                    match generation.recover() {
                        Ok(()) => info!("recovered, proxy keeps the previous config"),
                        Err(error) => error!(%error, "recover failed"),
                    }
                }
            }
        }
        debug!("config watch stopped");
    }
}

async fn register_health(health: &HealthSettings) -> Result<(), proxy_config_store::Error> {
    health.check.register_service(&health.registration).await?;
    health.check.register_check(&health.registration).await
}

/// The proxy: one generation of managers behind the HTTP endpoints
#[derive(Debug)]
pub struct ProxyService {
    source: Arc<dyn ConfigSource>,
    shared: Arc<Shared>,
    generation: RwLock<Arc<Generation>>,
    registry: Arc<Registry>,
    log_filter: LogFilterHandle,
    endpoints: BTreeMap<&'static str, Endpoint>,
}

impl ProxyService {
    /// Load the configuration, build the managers and wait for the first refresh
    pub async fn start(
        source: Arc<dyn ConfigSource>,
        registry: Arc<Registry>,
        log_filter: LogFilterHandle,
    ) -> Result<Self> {
        info!("starting proxy service");
        let (generation, changes, first) = prepare_generation(source.as_ref(), &registry).await?;
        let service = Self {
            source,
            shared: Arc::new(Shared {
                gate: tokio::sync::RwLock::new(()),
                available: AtomicBool::new(false),
                metrics: HttpMetrics::new(&registry),
            }),
            generation: RwLock::new(Arc::clone(&generation)),
            registry,
            log_filter,
            endpoints: endpoints(),
        };
        service.start_generation(&generation, changes, first).await?;
        service.shared.metrics.started(unix_now());
        info!("proxy service started");
        Ok(service)
    }

    async fn start_generation(
        &self,
        generation: &Arc<Generation>,
        changes: mpsc::Receiver<String>,
        first: String,
    ) -> Result<()> {
        let result = self.start_tasks(generation, changes, first).await;
        if result.is_err() {
            generation.tasks.shutdown().await;
        }
        result
    }

    async fn start_tasks(
        &self,
        generation: &Arc<Generation>,
        changes: mpsc::Receiver<String>,
        first: String,
    ) -> Result<()> {
        if let Err(error) = self.start_health(generation).await {
            error!(%error, "health check registration failed");
        }
        generation
            .backends
            .spawn_probe(generation.config.probe_interval, &generation.tasks);

        self.shared.refresh_all(generation).await?;
        info!(hash = %first, "initial config loaded");

        generation.tasks.spawn(Arc::clone(&self.shared).watch(
            Arc::clone(generation),
            changes,
            first,
        ));
        Ok(())
    }

    async fn start_health(&self, generation: &Generation) -> Result<()> {
        let Some(health) = generation.config.health.clone() else {
            warn!("no health check configured, skipping service registration");
            return Ok(());
        };
        register_health(&health).await?;
        info!(service = %health.registration.id, "service registered");

        let shared = Arc::clone(&self.shared);
        let token = generation.tasks.cancellation_token();
        generation.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(health.heartbeat);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !shared.is_available() {
                    continue;
                }
                if let Err(error) = health.check.check_pass(&health.registration.check_id).await {
                    warn!(%error, "health heartbeat failed");
                }
            }
            match health.check.deregister_service(&health.registration.id).await {
                Ok(()) => info!(service = %health.registration.id, "service deregistered"),
                Err(error) => warn!(%error, "service deregistration failed"),
            }
        });
        Ok(())
    }

    /// Replace the current generation with one built from a freshly loaded configuration
    ///
    /// The previous generation keeps running until the new one has received its first config
    /// from the store. Callers hold the gate exclusively.
    pub(crate) async fn reload(&self) -> Result<()> {
        info!("reloading proxy");
        let previous = self.generation();
        let was_available = self.is_available();
        if let Err(error) = self.shared.set_available(&previous, false).await {
            warn!(%error, "failed to report unavailability");
        }

        let (generation, changes, first) =
            match prepare_generation(self.source.as_ref(), &self.registry).await {
                Ok(prepared) => prepared,
                Err(error) => {
                    error!(%error, "reload failed, keeping the running config");
                    if let Err(error) = self.shared.set_available(&previous, was_available).await {
                        warn!(%error, "failed to report availability");
                    }
                    return Err(error);
                }
            };
        previous.tasks.shutdown().await;
        self.start_generation(&generation, changes, first).await?;
        *self.generation.write() = generation;
        self.shared.metrics.reloaded(unix_now());
        info!("reload proxy successful");
        Ok(())
    }

    /// Toggle availability, returning the new state
    pub(crate) async fn switch_available(&self) -> Result<bool> {
        let available = !self.is_available();
        self.shared
            .set_available(&self.generation(), available)
            .await
            .map_err(Error::Switch)?;
        info!(available, "switch successful");
        Ok(available)
    }

    /// Stop taking traffic and end the current generation
    pub async fn shutdown(&self) {
        let _guard = self.shared.gate.write().await;
        let generation = self.generation();
        if let Err(error) = self.shared.set_available(&generation, false).await {
            warn!(%error, "failed to report unavailability");
        }
        generation.tasks.shutdown().await;
        info!("proxy service stopped");
    }

    pub fn is_available(&self) -> bool {
        self.shared.is_available()
    }

    pub(crate) fn generation(&self) -> Arc<Generation> {
        Arc::clone(&self.generation.read())
    }

    pub(crate) fn gate(&self) -> &tokio::sync::RwLock<()> {
        &self.shared.gate
    }

    pub(crate) fn metrics(&self) -> &HttpMetrics {
        &self.shared.metrics
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn log_filter(&self) -> &LogFilterHandle {
        &self.log_filter
    }

    pub(crate) fn endpoint(&self, path: &str) -> Option<(&'static str, &Endpoint)> {
        self.endpoints
            .get_key_value(path)
            .map(|(path, endpoint)| (*path, endpoint))
    }
}

/// Build a generation from a fresh configuration and wait for the first config hash
///
/// The generation's tasks are stopped again if the store stays silent past the load timeout.
async fn prepare_generation(
    source: &dyn ConfigSource,
    registry: &Registry,
) -> Result<(Arc<Generation>, mpsc::Receiver<String>, String)> {
    let generation = Arc::new(Generation::new(source.load()?, registry)?);
    let mut changes = generation.store.watch_version_change(&generation.tasks);
    let timeout = generation.config.load_timeout;
    let first = match tokio::time::timeout(timeout, changes.recv()).await {
        Ok(Some(first)) => Ok(first),
        Ok(None) => Err(Error::WatchClosed),
        Err(_) => Err(Error::LoadTimeout(timeout)),
    };
    match first {
        Ok(first) => Ok((generation, changes, first)),
        Err(error) => {
            generation.tasks.shutdown().await;
            Err(error)
        }
    }
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}
