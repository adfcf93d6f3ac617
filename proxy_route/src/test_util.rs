use std::{collections::BTreeMap, sync::Arc};

use proxy_backend::mock::{MockBackend, MockRegistry};
use proxy_cluster::{ClusterContext, ClusterManager, ClusterMetrics};
use proxy_config_store::{ClusterInfo, MemoryStore, ProxyStore, RouteInfo};
use proxy_metric::Registry;
use proxy_shutdown::BackgroundTasks;

use crate::RouteManager;

/// Mock backends grouped into clusters over an in-memory store
#[derive(Debug)]
pub(crate) struct Fixture {
    pub(crate) registry: Arc<MockRegistry>,
    pub(crate) store: ProxyStore,
    pub(crate) clusters: Arc<ClusterManager>,
}

impl Fixture {
    pub(crate) fn new<const N: usize>(backends: [&str; N]) -> Self {
        Self::with_backends(backends.map(MockBackend::new))
    }

    pub(crate) fn with_backends(backends: impl IntoIterator<Item = MockBackend>) -> Self {
        let registry = Arc::new(
            backends
                .into_iter()
                .fold(MockRegistry::default(), MockRegistry::with_backend),
        );
        let store = ProxyStore::new(Arc::new(MemoryStore::new()), "proxy").unwrap();
        let metrics = Registry::new();
        let clusters = Arc::new(ClusterManager::new(ClusterContext {
            registry: Arc::clone(&registry) as _,
            store: store.clone(),
            tasks: BackgroundTasks::new(),
            metrics: ClusterMetrics::new(&metrics),
        }));
        Self {
            registry,
            store,
            clusters,
        }
    }

    pub(crate) async fn with_clusters(self, clusters: &[(&str, ClusterInfo)]) -> Self {
        let infos = clusters
            .iter()
            .map(|(name, info)| (name.to_string(), info.clone()))
            .collect::<BTreeMap<_, _>>();
        self.clusters.refresh(infos).await.unwrap();
        self
    }

    pub(crate) async fn routes(&self, routes: &[(&str, RouteInfo)]) -> RouteManager {
        let manager = RouteManager::new(
            Arc::clone(&self.clusters) as _,
            self.store.clone(),
            5000,
        );
        let infos = routes
            .iter()
            .map(|(key, info)| (key.to_string(), info.clone()))
            .collect();
        manager.refresh(infos).await.unwrap();
        manager
    }

    pub(crate) fn backend(&self, name: &str) -> Arc<MockBackend> {
        self.registry.backend(name).unwrap()
    }
}
