use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use parking_lot::Mutex;
use proxy_config_store::{HostInfo, ProxyStore};
use proxy_shutdown::BackgroundTasks;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{Backend, BackendRegistry, Error, HttpBackend, Result, Snapshot};

/// Builds backends for newly configured hosts
pub trait BackendFactory: Debug + Send + Sync + 'static {
    fn make(&self, name: &str, info: &HostInfo) -> Result<Arc<dyn Backend>>;
}

/// Creates an [`HttpBackend`] per host, sharing one HTTP client
#[derive(Debug, Clone)]
pub struct HttpBackendFactory {
    http_client: reqwest::Client,
}

impl HttpBackendFactory {
    pub fn new(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to the default http client");
                reqwest::Client::new()
            });
        Self { http_client }
    }
}

impl BackendFactory for HttpBackendFactory {
    fn make(&self, name: &str, info: &HostInfo) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(HttpBackend::new(
            name,
            info,
            self.http_client.clone(),
        )?))
    }
}

#[derive(Debug, Default)]
struct Backends {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    hosts: BTreeMap<String, HostInfo>,
}

/// Owns one [`Backend`] per configured host
#[derive(Debug)]
pub struct BackendManager {
    factory: Arc<dyn BackendFactory>,
    state: Snapshot<Backends>,
    refresh_lock: Mutex<()>,
}

impl BackendManager {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            state: Snapshot::default(),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Read all hosts from `store` and apply them
    pub async fn refresh_from_store(&self, store: &ProxyStore) -> Result<()> {
        let hosts = store.get_all_hosts().await?;
        self.refresh(hosts)
    }

    /// Bring the backends in line with `hosts`
    ///
    /// New hosts get a backend, changed hosts have their backend reset in place and removed
    /// hosts are dropped. Nothing changes unless every host can be applied.
    pub fn refresh(&self, hosts: BTreeMap<String, HostInfo>) -> Result<()> {
        let _guard = self.refresh_lock.lock();
        let current = self.state.load();

        let mut added = vec![];
        let mut modified = vec![];
        for (name, host) in &hosts {
            match current.hosts.get(name) {
                None => added.push(name),
                Some(previous) if previous != host => modified.push(name),
                Some(_) => {}
            }
        }
        let deleted = current
            .hosts
            .keys()
            .filter(|name| !hosts.contains_key(*name))
            .collect::<Vec<_>>();

        if added.is_empty() && modified.is_empty() && deleted.is_empty() {
            debug!("backends have no change");
            return Ok(());
        }

        // reject bad addresses before any backend is touched
        let mut failed = false;
        for name in added.iter().chain(&modified) {
            if let Err(e) = Url::parse(&hosts[*name].base_url()) {
                error!(backend = %name, error = %e, "invalid backend address");
                failed = true;
            }
        }
        if failed {
            return Err(Error::RefreshFailed);
        }

        let mut backends = current.backends.clone();
        for name in &added {
            match self.factory.make(name, &hosts[*name]) {
                Ok(backend) => {
                    backends.insert((*name).clone(), backend);
                }
                Err(e) => {
                    error!(backend = %name, error = %e, "add backend failed");
                    failed = true;
                }
            }
        }
        for name in &modified {
            let result = match backends.get(*name) {
                Some(backend) => backend.reset(&hosts[*name]),
                None => Err(Error::BackendNotExist(vec![(*name).clone()])),
            };
            if let Err(e) = result {
                error!(backend = %name, error = %e, "modify backend failed");
                failed = true;
            }
        }
        if failed {
            error!("refresh backends canceled");
            return Err(Error::RefreshFailed);
        }
        for name in &deleted {
            backends.remove(*name);
        }

        info!(
            added = added.len(),
            modified = modified.len(),
            deleted = deleted.len(),
            "backends refreshed"
        );
        self.state.store(Backends { backends, hosts });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.state.load().backends.get(name).map(Arc::clone)
    }

    pub fn backup(&self) {
        self.state.backup();
    }

    pub fn recover(&self) -> Result<()> {
        Ok(self.state.recover()?)
    }

    /// One line per backend, ordered by name
    pub fn print(&self) -> String {
        self.state
            .load()
            .backends
            .values()
            .map(|b| format!("{}\n", b.describe()))
            .collect()
    }

    /// Periodically ping backends that were taken out of rotation
    pub fn spawn_probe(self: &Arc<Self>, interval: Duration, tasks: &BackgroundTasks) {
        let manager = Arc::clone(self);
        let token = tasks.child_token();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let backends = manager.state.load();
                for backend in backends.backends.values().filter(|b| !b.readable()) {
                    if let Err(e) = backend.ping().await {
                        debug!(backend = %backend.name(), error = %e, "backend still unreachable");
                    }
                }
            }
        });
    }
}

impl BackendRegistry for BackendManager {
    fn backends(&self, names: &[String]) -> Result<Vec<Arc<dyn Backend>>> {
        let state = self.state.load();
        let mut found = Vec::with_capacity(names.len());
        let mut missing = vec![];
        for name in names {
            match state.backends.get(name) {
                Some(backend) if backend.disabled() => {}
                Some(backend) => found.push(Arc::clone(backend)),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::BackendNotExist(missing));
        }
        Ok(found)
    }
}
