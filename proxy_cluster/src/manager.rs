use std::{collections::BTreeMap, sync::Arc};

use proxy_backend::Snapshot;
use proxy_config_store::ClusterInfo;
use tracing::{debug, error, info};

use crate::{Cluster, ClusterContext, ClusterLookup, Error, Result, cluster::Members};

#[derive(Debug, Default)]
struct Clusters {
    clusters: BTreeMap<String, Arc<Cluster>>,
    infos: BTreeMap<String, ClusterInfo>,
    /// Membership of every cluster when this state was installed, as resets happen in place
    members: BTreeMap<String, Arc<Members>>,
}

/// Owns the clusters configured in the `cluster_info` records
#[derive(Debug)]
pub struct ClusterManager {
    ctx: ClusterContext,
    state: Snapshot<Clusters>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ClusterManager {
    pub fn new(ctx: ClusterContext) -> Self {
        Self {
            ctx,
            state: Snapshot::default(),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn refresh_from_store(&self) -> Result<()> {
        let infos = self.ctx.store.get_all_clusters().await?;
        self.refresh(infos).await
    }

    /// Bring the clusters in line with `infos`
    ///
    /// New clusters are built, changed ones reset in place and removed ones dropped. Nothing
    /// changes unless every cluster can be applied.
    pub async fn refresh(&self, infos: BTreeMap<String, ClusterInfo>) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.state.load();

        let mut added = vec![];
        let mut modified = vec![];
        for (name, info) in &infos {
            match current.infos.get(name) {
                None => added.push(name),
                Some(previous) if previous != info => modified.push(name),
                Some(_) => {}
            }
        }
        let deleted = current
            .infos
            .keys()
            .filter(|name| !infos.contains_key(*name))
            .collect::<Vec<_>>();

        if added.is_empty() && modified.is_empty() && deleted.is_empty() {
            debug!("clusters have no change");
            return Ok(());
        }

        let mut failed = false;
        let mut clusters = current.clusters.clone();
        for name in &added {
            match Cluster::new(name.as_str(), &infos[*name], &self.ctx).await {
                Ok(cluster) => {
                    clusters.insert((*name).clone(), Arc::new(cluster));
                }
                Err(e) => {
                    error!(cluster = %name, error = %e, "add cluster failed");
                    failed = true;
                }
            }
        }

        let mut resets = Vec::with_capacity(modified.len());
        for name in &modified {
            let prepared = match clusters.get(*name) {
                Some(cluster) => cluster
                    .prepare(&infos[*name])
                    .map(|members| (Arc::clone(cluster), members)),
                None => Err(Error::ClusterNotExist((*name).clone())),
            };
            match prepared {
                Ok(reset) => resets.push(reset),
                Err(e) => {
                    error!(cluster = %name, error = %e, "modify cluster failed");
                    failed = true;
                }
            }
        }

        if failed {
            error!("refresh clusters canceled");
            return Err(Error::RefreshFailed);
        }
        for (cluster, members) in resets {
            cluster.install(members);
        }
        for name in &deleted {
            clusters.remove(*name);
        }

        info!(
            added = added.len(),
            modified = modified.len(),
            deleted = deleted.len(),
            "clusters refreshed"
        );
        let members = clusters
            .iter()
            .map(|(name, cluster)| (name.clone(), cluster.members()))
            .collect();
        self.state.store(Clusters {
            clusters,
            infos,
            members,
        });
        Ok(())
    }

    pub fn backup(&self) {
        self.state.backup();
    }

    /// Restore the clusters and their membership as of the last [`Self::backup`]
    pub fn recover(&self) -> Result<()> {
        self.state.recover()?;
        let state = self.state.load();
        for (name, cluster) in &state.clusters {
            if let Some(members) = state.members.get(name) {
                cluster.install(Arc::clone(members));
            }
        }
        Ok(())
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.state.load().clusters.keys().cloned().collect()
    }

    /// One line per cluster, ordered by name
    pub fn print(&self) -> String {
        self.state
            .load()
            .clusters
            .values()
            .map(|c| format!("{c}\n"))
            .collect()
    }
}

impl ClusterLookup for ClusterManager {
    fn get_cluster(&self, name: &str) -> Result<Arc<Cluster>> {
        self.state
            .load()
            .clusters
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| Error::ClusterNotExist(name.to_string()))
    }
}
