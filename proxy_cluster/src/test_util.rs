use std::sync::Arc;

use proxy_backend::mock::{MockBackend, MockRegistry};
use proxy_config_store::{ClusterInfo, MemoryStore, ProxyStore};
use proxy_metric::Registry;
use proxy_shutdown::BackgroundTasks;

use crate::{Cluster, ClusterContext, ClusterMetrics};

pub(crate) fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

/// Mock backends and an in-memory store wired into a [`ClusterContext`]
#[derive(Debug)]
pub(crate) struct Fixture {
    pub(crate) registry: Arc<MockRegistry>,
    pub(crate) store: ProxyStore,
    pub(crate) metrics: Arc<Registry>,
    pub(crate) ctx: ClusterContext,
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
        let metrics = Arc::new(Registry::new());
        let ctx = ClusterContext {
            registry: Arc::clone(&registry) as _,
            store: store.clone(),
            tasks: BackgroundTasks::new(),
            metrics: ClusterMetrics::new(&metrics),
        };
        Self {
            registry,
            store,
            metrics,
            ctx,
        }
    }

    pub(crate) async fn cluster(&self, name: &str, info: ClusterInfo) -> Cluster {
        Cluster::new(name, &info, &self.ctx).await.unwrap()
    }

    pub(crate) fn backend(&self, name: &str) -> Arc<MockBackend> {
        self.registry.backend(name).unwrap()
    }
}
