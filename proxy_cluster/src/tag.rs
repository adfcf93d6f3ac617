//! Placement of tag shards onto the hosts of a cluster
use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use parking_lot::RwLock;
use proxy_backend::{Backend, BackendRegistry};
use proxy_config_store::{ProxyStore, TagInfo, TagStatus};
use proxy_shutdown::BackgroundTasks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{JumpHash, Result};

/// Hosts a tag shard is placed on when it has no record yet
pub const DEFAULT_REPLICAS: usize = 2;

/// The tag key of a series: `db/measurement/tag1==value1[/tag2==value2]`
///
/// Tags follow the order of `tag_names`; a tag without a value contributes an empty value.
pub fn tag_key<'a, F>(db: &str, measurement: &str, tag_names: &[String], value_of: F) -> String
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut key = format!("{db}/{measurement}");
    for name in tag_names {
        key.push('/');
        key.push_str(name);
        key.push_str("==");
        key.push_str(value_of(name).unwrap_or_default());
    }
    key
}

/// Hosts receiving writes for a shard: `host_list` plus the write-only hosts
///
/// While a migration is in flight the hosts being drained still serve reads, so they keep
/// receiving writes until the record is promoted back to `ready`.
pub fn write_hosts(info: &TagInfo) -> Vec<String> {
    let migrating = info.status != TagStatus::Ready;
    let mut hosts: Vec<String> = Vec::with_capacity(info.host_list.len());
    for host in info.host_list.iter().chain(&info.unreadable_host) {
        let drained = !migrating && info.delete_host_list.contains(host);
        if !drained && !hosts.contains(host) {
            hosts.push(host.clone());
        }
    }
    hosts
}

/// Hosts serving reads for a shard
///
/// A migrating shard reads from its readable hosts. Once promoted, drained hosts are left out
/// unless nothing else is readable.
pub fn read_hosts(info: &TagInfo) -> Vec<String> {
    let readable = info.readable_hosts();
    if info.status != TagStatus::Ready {
        return readable;
    }
    let active: Vec<String> = readable
        .iter()
        .filter(|h| !info.delete_host_list.contains(h))
        .cloned()
        .collect();
    if active.is_empty() { readable } else { active }
}

/// The tag records of one cluster, kept in sync with the config store
#[derive(Debug)]
pub struct TagInfoManager {
    cluster: String,
    store: ProxyStore,
    registry: Arc<dyn BackendRegistry>,
    replicas: usize,
    records: RwLock<Arc<BTreeMap<String, TagInfo>>>,
    placement: RwLock<Arc<JumpHash<String>>>,
}

impl TagInfoManager {
    /// Shards without a record are placed on `replicas` of `hosts`
    pub fn new(
        cluster: impl Into<String>,
        store: ProxyStore,
        registry: Arc<dyn BackendRegistry>,
        replicas: usize,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            store,
            registry,
            replicas,
            records: Default::default(),
            placement: RwLock::new(Arc::new(JumpHash::new(hosts))),
        }
    }

    /// Reload every tag record of the cluster
    pub async fn refresh(&self) -> Result<()> {
        let records = self
            .store
            .get_tag_infos(&self.cluster)
            .await?
            .into_iter()
            .map(|(key, record)| (key, record.info))
            .collect::<BTreeMap<_, _>>();
        debug!(cluster = %self.cluster, records = records.len(), "tag info refreshed");
        *self.records.write() = Arc::new(records);
        Ok(())
    }

    /// Replace the hosts shards without a record are placed on
    pub fn reset(&self, hosts: Vec<String>) {
        *self.placement.write() = Arc::new(JumpHash::new(hosts));
    }

    fn record(&self, key: &str) -> Option<TagInfo> {
        self.records.read().get(key).cloned()
    }

    fn default_hosts(&self, key: &str) -> Vec<String> {
        let placement = Arc::clone(&self.placement.read());
        placement
            .replicas(key, self.replicas)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn write_hosts(&self, key: &str) -> Vec<String> {
        match self.record(key) {
            Some(info) => write_hosts(&info),
            None => self.default_hosts(key),
        }
    }

    pub fn read_hosts(&self, key: &str) -> Vec<String> {
        match self.record(key) {
            Some(info) => read_hosts(&info),
            None => self.default_hosts(key),
        }
    }

    pub fn write_backends(&self, key: &str) -> Result<Vec<Arc<dyn Backend>>> {
        Ok(self.registry.backends(&self.write_hosts(key))?)
    }

    pub fn read_backends(&self, key: &str) -> Result<Vec<Arc<dyn Backend>>> {
        Ok(self.registry.backends(&self.read_hosts(key))?)
    }

    /// Keys of every record of the `db/measurement` named by `prefix`
    pub fn read_keys(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{prefix}/");
        self.records
            .read()
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Refresh whenever the tag version of the cluster changes, until `token` is cancelled
    pub fn spawn_watch(self: &Arc<Self>, tasks: &BackgroundTasks, token: CancellationToken) {
        let manager = Arc::clone(self);
        let mut changes = self.store.watch_tag_change(&self.cluster, tasks);
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                    }
                }
                match manager.refresh().await {
                    Ok(()) => info!(cluster = %manager.cluster, "tag info reloaded"),
                    Err(e) => warn!(cluster = %manager.cluster, error = %e, "reload tag info failed"),
                }
            }
            debug!(cluster = %manager.cluster, "tag watch stopped");
        });
    }
}

impl Display for TagInfoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let records = Arc::clone(&self.records.read());
        write!(f, "tags:[")?;
        for (i, (key, info)) in records.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}:{:?}", write_hosts(info))?;
        }
        write!(f, "]")
    }
}
