//! The key layout of proxy configuration and typed access to it
use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use proxy_shutdown::BackgroundTasks;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    ClusterInfo, ConfigStore, Error, HostInfo, KvPair, Result, RouteInfo, TagInfo, TagRecord,
    watch::watch_change,
};

pub const HOST_INFO_PATH: &str = "host_info";
pub const CLUSTER_INFO_PATH: &str = "cluster_info";
pub const ROUTE_PATH: &str = "router";
pub const TAG_INFO_PATH: &str = "tag_info";
pub const VERSION_PATH: &str = "version";
pub const LOCK_PATH: &str = "lock_path";

/// Key of the per-cluster tag version below `tag_info/<cluster>/`
const TAG_VERSION_KEY: &str = "version";

/// Proxy configuration rooted at a prefix of a [`ConfigStore`]
#[derive(Debug, Clone)]
pub struct ProxyStore {
    store: Arc<dyn ConfigStore>,
    prefix: String,
}

impl ProxyStore {
    pub fn new(store: Arc<dyn ConfigStore>, prefix: impl AsRef<str>) -> Result<Self> {
        let prefix = prefix.as_ref().trim_matches('/');
        if prefix.is_empty() {
            return Err(Error::EmptyPrefix);
        }
        Ok(Self {
            store,
            prefix: prefix.to_string(),
        })
    }

    /// The raw store
    pub fn inner(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Absolute path of `parts` joined below the prefix
    pub fn path(&self, parts: &[&str]) -> String {
        let mut path = self.prefix.clone();
        for part in parts {
            path.push('/');
            path.push_str(part);
        }
        path
    }

    fn dir(&self, parts: &[&str]) -> String {
        let mut dir = self.path(parts);
        dir.push('/');
        dir
    }

    pub fn version_path(&self) -> String {
        self.dir(&[VERSION_PATH])
    }

    pub fn tag_version_path(&self, cluster: &str) -> String {
        self.path(&[TAG_INFO_PATH, cluster, TAG_VERSION_KEY])
    }

    /// The lock serializing tag rebalancing across proxies
    pub fn tag_lock_path(&self) -> String {
        self.path(&[LOCK_PATH, TAG_INFO_PATH])
    }

    /// Decoded records under `dir`, keyed by the path relative to it
    async fn read_records<T: DeserializeOwned>(
        &self,
        dir: &str,
        kind: &'static str,
    ) -> Result<Vec<(String, T, Bytes)>> {
        let pairs = self.store.get_prefix(dir).await?;
        pairs
            .into_iter()
            .filter_map(|KvPair { key, value }| {
                let relative = key.strip_prefix(dir)?.to_string();
                // folder markers carry no record
                if relative.is_empty() || relative.ends_with('/') {
                    return None;
                }
                Some((relative, key, value))
            })
            .map(|(relative, key, value)| {
                let record = serde_json::from_slice(&value)
                    .map_err(|source| Error::Decode { kind, key, source })?;
                Ok((relative, record, value))
            })
            .collect()
    }

    pub async fn get_all_hosts(&self) -> Result<BTreeMap<String, HostInfo>> {
        let dir = self.dir(&[HOST_INFO_PATH]);
        Ok(self
            .read_records(&dir, "host info")
            .await?
            .into_iter()
            .map(|(name, host, _)| (name, host))
            .collect())
    }

    pub async fn get_all_clusters(&self) -> Result<BTreeMap<String, ClusterInfo>> {
        let dir = self.dir(&[CLUSTER_INFO_PATH]);
        Ok(self
            .read_records(&dir, "cluster info")
            .await?
            .into_iter()
            .map(|(name, cluster, _)| (name, cluster))
            .collect())
    }

    /// Every route, keyed `db.table`
    pub async fn get_all_routes(&self) -> Result<BTreeMap<String, RouteInfo>> {
        let dir = self.dir(&[ROUTE_PATH]);
        let mut routes = BTreeMap::new();
        for (relative, route, _) in self.read_records::<RouteInfo>(&dir, "route").await? {
            match relative.split_once('/') {
                Some((db, table)) if !db.is_empty() && !table.is_empty() => {
                    routes.insert(format!("{db}.{table}"), route);
                }
                _ => warn!(key = %relative, "ignoring route without a table"),
            }
        }
        Ok(routes)
    }

    /// The distinct databases that have routes, sorted
    pub async fn get_db_names(&self) -> Result<Vec<String>> {
        let dir = self.dir(&[ROUTE_PATH]);
        let mut names = self
            .store
            .get_child(&dir)
            .await?
            .into_iter()
            .filter_map(|child| {
                let name = child.strip_prefix(&dir)?.trim_end_matches('/');
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Every tag record of `cluster`, keyed `db/measurement/tag==value`
    pub async fn get_tag_infos(&self, cluster: &str) -> Result<BTreeMap<String, TagRecord>> {
        let dir = self.dir(&[TAG_INFO_PATH, cluster]);
        Ok(self
            .read_records::<TagInfo>(&dir, "tag info")
            .await?
            .into_iter()
            .filter(|(key, _, _)| key != TAG_VERSION_KEY)
            .map(|(key, info, raw)| (key.clone(), TagRecord { key, info, raw }))
            .collect())
    }

    pub async fn get_tag_info(&self, cluster: &str, tag_key: &str) -> Result<Option<TagRecord>> {
        let key = self.path(&[TAG_INFO_PATH, cluster, tag_key]);
        match self.store.get(&key).await? {
            Some(raw) => {
                let info = serde_json::from_slice(&raw).map_err(|source| Error::Decode {
                    kind: "tag info",
                    key,
                    source,
                })?;
                Ok(Some(TagRecord {
                    key: tag_key.to_string(),
                    info,
                    raw,
                }))
            }
            None => Ok(None),
        }
    }

    /// Replace `previous` with `next`, returning `false` if the record changed in between
    pub async fn cas_tag_info(
        &self,
        cluster: &str,
        previous: &TagRecord,
        next: &TagInfo,
    ) -> Result<bool> {
        let path = self.path(&[TAG_INFO_PATH, cluster, &previous.key]);
        self.store
            .cas(&path, Some(previous.raw.as_ref()), encode(next, "tag info")?)
            .await
    }

    pub async fn put_host(&self, name: &str, host: &HostInfo) -> Result<()> {
        self.put_record(&[HOST_INFO_PATH, name], host, "host info")
            .await
    }

    pub async fn put_cluster(&self, name: &str, cluster: &ClusterInfo) -> Result<()> {
        self.put_record(&[CLUSTER_INFO_PATH, name], cluster, "cluster info")
            .await
    }

    pub async fn put_route(&self, db: &str, table: &str, route: &RouteInfo) -> Result<()> {
        self.put_record(&[ROUTE_PATH, db, table], route, "route")
            .await
    }

    pub async fn put_tag_info(&self, cluster: &str, tag_key: &str, info: &TagInfo) -> Result<()> {
        self.put_record(&[TAG_INFO_PATH, cluster, tag_key], info, "tag info")
            .await
    }

    async fn put_record<T: Serialize + Sync>(
        &self,
        parts: &[&str],
        record: &T,
        kind: &'static str,
    ) -> Result<()> {
        self.store
            .put(&self.path(parts), encode(record, kind)?)
            .await
    }

    /// Tell the proxies watching `cluster` that its tag records changed
    pub async fn notify_tag_version(&self, cluster: &str) -> Result<()> {
        self.store
            .put(&self.tag_version_path(cluster), version_stamp())
            .await
    }

    /// Tell every proxy that the configuration changed
    pub async fn notify_version(&self) -> Result<()> {
        self.store.put(&self.version_path(), version_stamp()).await
    }

    /// Hashes of hosts, clusters and routes, emitted whenever the global version changes
    pub fn watch_version_change(&self, tasks: &BackgroundTasks) -> mpsc::Receiver<String> {
        watch_change(
            Arc::clone(&self.store),
            self.version_path(),
            vec![
                self.dir(&[HOST_INFO_PATH]),
                self.dir(&[CLUSTER_INFO_PATH]),
                self.dir(&[ROUTE_PATH]),
            ],
            tasks,
        )
    }

    /// A signal for every change of the tag version of `cluster`
    pub fn watch_tag_change(&self, cluster: &str, tasks: &BackgroundTasks) -> mpsc::Receiver<String> {
        watch_change(
            Arc::clone(&self.store),
            self.tag_version_path(cluster),
            vec![],
            tasks,
        )
    }
}

fn encode<T: Serialize>(record: &T, kind: &'static str) -> Result<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|source| Error::Encode { kind, source })
}

fn version_stamp() -> Bytes {
    Bytes::from(chrono::Utc::now().timestamp_millis().to_string())
}
