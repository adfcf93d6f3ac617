//! Moves tag shards onto the hosts their cluster's consistent hash now assigns them
//!
//! A rebalance never moves data itself. It marks every shard whose placement changed as
//! `changed`, listing the hosts to fill in `unreadable_host` and the ones to drain in
//! `delete_host_list`; proxies start writing to both sets as soon as they see the new record.
//! Only one rebalance runs at a time across all instances, guarded by a lock in the store.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use proxy_cluster::{DEFAULT_REPLICAS, JumpHash};
use proxy_config_store::{DistributedLock, ProxyStore, TagInfo, TagRecord, TagStatus};
use proxy_shutdown::BackgroundTasks;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lifetime of the lock session when renewal stops
pub const LOCK_TTL: Duration = Duration::from_secs(60);

pub const LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum Error {
    #[error("another rebalance holds the lock at {0}")]
    LockHeld(String),

    #[error("tag info {key} of cluster {cluster} changed during rebalance")]
    TagInfoChanged { cluster: String, key: String },

    #[error("config store error: {0}")]
    Store(#[from] proxy_config_store::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The tag shards a rebalance marked for migration, by cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub changed: BTreeMap<String, Vec<String>>,
}

impl RebalanceReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    fn record(&mut self, cluster: &str, key: &str) {
        self.changed
            .entry(cluster.to_string())
            .or_default()
            .push(key.to_string());
    }
}

/// The migration that moves a shard with `info` to its hashed placement, if it is misplaced
///
/// The shard keeps as many replicas as it has hosts, or [`DEFAULT_REPLICAS`] if it has none.
/// Timestamps of the previous record never move backwards.
pub fn plan(placement: &JumpHash<String>, key: &str, info: &TagInfo, now: i64) -> Option<TagInfo> {
    let replicas = match info.host_list.len() {
        0 => DEFAULT_REPLICAS,
        n => n,
    };
    let desired = placement.replicas(key, replicas);
    let add = desired
        .iter()
        .filter(|host| !info.host_list.contains(host))
        .map(|host| host.to_string())
        .collect::<Vec<_>>();
    let delete = info
        .host_list
        .iter()
        .filter(|host| !desired.contains(host))
        .cloned()
        .collect::<Vec<_>>();
    if add.is_empty() && delete.is_empty() {
        return None;
    }

    Some(TagInfo {
        host_list: info.host_list.clone(),
        unreadable_host: add,
        delete_host_list: delete,
        status: TagStatus::Changed,
        transfer_start_time: now.max(info.transfer_start_time),
        transfer_end_time: info.transfer_end_time,
        delete_time: info.delete_time,
    })
}

#[derive(Debug)]
pub struct Rebalancer {
    store: ProxyStore,
    tasks: BackgroundTasks,
    lock_ttl: Duration,
    renew_every: Duration,
}

impl Rebalancer {
    pub fn new(store: ProxyStore, tasks: BackgroundTasks) -> Self {
        Self {
            store,
            tasks,
            lock_ttl: LOCK_TTL,
            renew_every: LOCK_RENEW_INTERVAL,
        }
    }

    pub fn with_lock_timing(mut self, ttl: Duration, renew_every: Duration) -> Self {
        self.lock_ttl = ttl;
        self.renew_every = renew_every;
        self
    }

    /// Rebalance every cluster while holding the rebalance lock
    pub async fn run(&self) -> Result<RebalanceReport> {
        let path = self.store.tag_lock_path();
        let Some(lock) = DistributedLock::acquire(
            Arc::clone(self.store.inner()),
            path.clone(),
            self.lock_ttl,
            self.renew_every,
            &self.tasks,
        )
        .await?
        else {
            return Err(Error::LockHeld(path));
        };

        let mut report = RebalanceReport::default();
        let result = self.rebalance_clusters(&mut report).await;
        let notified = self.notify(&report).await;
        let released = lock.release().await;

        result?;
        notified?;
        released?;
        info!(
            clusters = report.changed.len(),
            shards = report.changed.values().map(Vec::len).sum::<usize>(),
            "rebalance finished"
        );
        Ok(report)
    }

    async fn rebalance_clusters(&self, report: &mut RebalanceReport) -> Result<()> {
        let hosts = self.store.get_all_hosts().await?;
        let now = chrono::Utc::now().timestamp();

        for (cluster, info) in self.store.get_all_clusters().await? {
            let backends = info
                .host_list
                .iter()
                .filter(|host| hosts.get(*host).is_some_and(|h| !h.disabled))
                .cloned()
                .collect::<Vec<_>>();
            if backends.is_empty() {
                warn!(%cluster, "cluster has no enabled host, skipped");
                continue;
            }
            let placement = JumpHash::new(backends);

            for record in self.store.get_tag_infos(&cluster).await?.values() {
                if record.info.status != TagStatus::Ready {
                    debug!(%cluster, key = %record.key, status = ?record.info.status, "tag info in migration, skipped");
                    continue;
                }
                let Some(next) = plan(&placement, &record.key, &record.info, now) else {
                    continue;
                };
                self.update(&cluster, record, &next).await?;
                info!(
                    %cluster,
                    key = %record.key,
                    add = ?next.unreadable_host,
                    delete = ?next.delete_host_list,
                    "tag info marked for migration"
                );
                report.record(&cluster, &record.key);
            }
        }
        Ok(())
    }

    /// Replace `record` with `next`, failing if someone else changed it since it was read
    async fn update(&self, cluster: &str, record: &TagRecord, next: &TagInfo) -> Result<()> {
        if self.store.cas_tag_info(cluster, record, next).await? {
            Ok(())
        } else {
            Err(Error::TagInfoChanged {
                cluster: cluster.to_string(),
                key: record.key.clone(),
            })
        }
    }

    async fn notify(&self, report: &RebalanceReport) -> Result<()> {
        if report.is_empty() {
            return Ok(());
        }
        for cluster in report.changed.keys() {
            self.store.notify_tag_version(cluster).await?;
        }
        self.store.notify_version().await?;
        Ok(())
    }
}
