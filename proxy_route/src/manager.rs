use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use proxy_backend::Snapshot;
use proxy_cluster::{Cluster, ClusterLookup};
use proxy_config_store::{ProxyStore, RouteInfo};
use tracing::{debug, error, info};

use crate::{DEFAULT_CLUSTER, DEFAULT_TABLE, Error, Result};

/// A resolved route
#[derive(Debug, Clone)]
pub struct Route {
    pub cluster: Arc<Cluster>,
    /// Tag keys the table is sharded on, empty for unsharded tables
    pub tag_names: Arc<[String]>,
}

#[derive(Debug, Default)]
struct Routes {
    routes: BTreeMap<String, Route>,
    infos: BTreeMap<String, RouteInfo>,
}

/// Resolves route keys to clusters and runs requests on them
#[derive(Debug)]
pub struct RouteManager {
    pub(crate) clusters: Arc<dyn ClusterLookup>,
    pub(crate) store: ProxyStore,
    pub(crate) batch_size: usize,
    state: Snapshot<Routes>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl RouteManager {
    pub fn new(clusters: Arc<dyn ClusterLookup>, store: ProxyStore, batch_size: usize) -> Self {
        Self {
            clusters,
            store,
            batch_size: batch_size.max(1),
            state: Snapshot::default(),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn refresh_from_store(&self) -> Result<()> {
        let infos = self.store.get_all_routes().await?;
        self.refresh(infos).await
    }

    /// Replace the routes with `infos`
    ///
    /// Every route must name an existing cluster, otherwise nothing changes.
    pub async fn refresh(&self, infos: BTreeMap<String, RouteInfo>) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.state.load();

        let mut routes = BTreeMap::new();
        let mut failed = false;
        for (key, info) in &infos {
            match self.clusters.get_cluster(&info.cluster) {
                Ok(cluster) => {
                    routes.insert(
                        key.clone(),
                        Route {
                            cluster,
                            tag_names: info.partition_tag.clone().into(),
                        },
                    );
                }
                Err(e) => {
                    error!(route = %key, cluster = %info.cluster, error = %e, "cluster of route not found");
                    failed = true;
                }
            }
        }
        if failed {
            return Err(Error::RefreshFailed);
        }

        let unchanged = current.infos == infos
            && current.routes.iter().all(|(key, route)| {
                routes
                    .get(key)
                    .is_some_and(|r| Arc::ptr_eq(&r.cluster, &route.cluster))
            });
        if unchanged {
            debug!("routes have no change");
            return Ok(());
        }

        info!(routes = routes.len(), "routes refreshed");
        self.state.store(Routes { routes, infos });
        Ok(())
    }

    pub fn backup(&self) {
        self.state.backup();
    }

    pub fn recover(&self) -> Result<()> {
        Ok(self.state.recover()?)
    }

    /// Resolve `key` (`db.table`)
    ///
    /// Falls back to the database-wide route `db.__default__`, then to the `_default` cluster.
    /// Only an exact match carries tag keys.
    pub fn get_route(&self, key: &str) -> Result<Route> {
        let state = self.state.load();
        if let Some(route) = state.routes.get(key) {
            return Ok(route.clone());
        }

        let segments = key.split('.').collect::<Vec<_>>();
        if let [db, _] = segments.as_slice()
            && let Some(route) = state.routes.get(&crate::route_key(db, DEFAULT_TABLE))
        {
            return Ok(Route {
                cluster: Arc::clone(&route.cluster),
                tag_names: Arc::new([]),
            });
        }

        self.default_cluster()
            .map(|cluster| Route {
                cluster,
                tag_names: Arc::new([]),
            })
            .inspect_err(|_| error!(route = %key, "no cluster matches route"))
    }

    pub fn get_cluster_by_route(&self, key: &str) -> Result<Arc<Cluster>> {
        self.get_route(key).map(|route| route.cluster)
    }

    /// The cluster called `name`, or the `_default` cluster
    pub fn get_cluster_by_name(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters.get_cluster(name).or_else(|e| {
            debug!(cluster = %name, error = %e, "falling back to the default cluster");
            self.default_cluster()
        })
    }

    fn default_cluster(&self) -> Result<Arc<Cluster>> {
        self.clusters.get_cluster(DEFAULT_CLUSTER).map_err(|e| {
            error!(error = %e, "get default cluster failed");
            Error::GetClusterFailed
        })
    }

    /// One line per route, ordered by key
    pub fn print(&self) -> String {
        self.state
            .load()
            .routes
            .iter()
            .map(|(key, route)| format!("{}\n", PrintRoute(key, route)))
            .collect()
    }
}

struct PrintRoute<'a>(&'a str, &'a Route);

impl Display for PrintRoute<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self(key, route) = self;
        write!(f, "route:{key},cluster:{}", route.cluster.name())?;
        if !route.tag_names.is_empty() {
            write!(f, ",tags:{:?}", route.tag_names)?;
        }
        Ok(())
    }
}
