use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use proxy_backend::mock::MockBackendFactory;
use proxy_config_store::{
    ClusterInfo, HostInfo, MemoryStore, ProxyStore, RouteInfo, ServiceRegistration,
};
use proxy_metric::Registry;
use proxy_trogging::LogFilterHandle;

use crate::{BasicCredentials, ConfigSource, HealthSettings, ProxyService, Result, ServiceConfig};

pub(crate) const ADMIN_TOKEN: &str = "t0ken";

/// Hands out the same configuration on every load
#[derive(Debug)]
pub(crate) struct StaticSource(pub(crate) Mutex<ServiceConfig>);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<ServiceConfig> {
        Ok(self.0.lock().clone())
    }
}

/// An in-memory store with hosts `h1` and `h2`, cluster `cl1` on `h1`, the default cluster on
/// `h2` and the route `db1.cpu -> cl1`
#[derive(Debug)]
pub(crate) struct Fixture {
    pub(crate) memory: Arc<MemoryStore>,
    pub(crate) store: ProxyStore,
    pub(crate) factory: Arc<MockBackendFactory>,
    pub(crate) source: Arc<StaticSource>,
}

impl Fixture {
    pub(crate) async fn new() -> Self {
        let memory = Arc::new(MemoryStore::new());
        let store = ProxyStore::new(Arc::clone(&memory) as _, "proxy").unwrap();
        store
            .put_host("h1", &HostInfo::new("h1.local", 8086))
            .await
            .unwrap();
        store
            .put_host("h2", &HostInfo::new("h2.local", 8086))
            .await
            .unwrap();
        store
            .put_cluster("cl1", &ClusterInfo::new(["h1"]))
            .await
            .unwrap();
        store
            .put_cluster("_default", &ClusterInfo::new(["h2"]))
            .await
            .unwrap();
        store
            .put_route("db1", "cpu", &RouteInfo::new("cl1"))
            .await
            .unwrap();
        store.notify_version().await.unwrap();

        let factory = Arc::new(MockBackendFactory::default());
        let config = ServiceConfig {
            store: Arc::clone(&memory) as _,
            prefix: "proxy".to_string(),
            backends: Arc::clone(&factory) as _,
            batch_size: 100,
            max_request_size: 1024 * 1024,
            auth_token: Some(ADMIN_TOKEN.to_string()),
            basic_auth: None,
            health: Some(HealthSettings {
                check: Arc::clone(&memory) as _,
                registration: registration(),
                heartbeat: Duration::from_millis(50),
            }),
            probe_interval: Duration::from_secs(60),
            load_timeout: Duration::from_secs(5),
        };
        Self {
            memory,
            store,
            factory,
            source: Arc::new(StaticSource(Mutex::new(config))),
        }
    }

    pub(crate) fn with_basic_auth(self, credentials: BasicCredentials) -> Self {
        self.source.0.lock().basic_auth = Some(credentials);
        self
    }

    pub(crate) fn registration(&self) -> ServiceRegistration {
        registration()
    }

    pub(crate) async fn start(&self) -> ProxyService {
        ProxyService::start(
            Arc::clone(&self.source) as _,
            Arc::new(Registry::new()),
            LogFilterHandle::detached(),
        )
        .await
        .unwrap()
    }
}

fn registration() -> ServiceRegistration {
    ServiceRegistration::new("proxy", "127.0.0.1", 10201, Duration::from_secs(30))
}

/// Poll `condition` until it holds, failing after five seconds
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
