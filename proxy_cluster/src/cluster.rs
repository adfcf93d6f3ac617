use std::{collections::BTreeMap, fmt::Display, future::Future, sync::Arc};

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use proxy_backend::{Backend, BackendRegistry, QueryParams, Response, WriteParams};
use proxy_config_store::{ClusterInfo, ProxyStore};
use proxy_line_protocol::Point;
use proxy_shutdown::BackgroundTasks;
use tokio_util::sync::DropGuard;
use tracing::{debug, error, warn};

use crate::{
    ClusterMetrics, Error, Result, TagInfoManager,
    balance::BalanceCounter,
    info::merge_infos,
    metrics::{Action, Outcome},
    tag::{DEFAULT_REPLICAS, tag_key},
};

/// Everything a [`Cluster`] needs from its surroundings
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub registry: Arc<dyn BackendRegistry>,
    pub store: ProxyStore,
    /// Owner of the per-cluster tag watch tasks
    pub tasks: BackgroundTasks,
    pub metrics: ClusterMetrics,
}

/// The backends of a cluster at one point in time
#[derive(Debug, Default)]
pub(crate) struct Members {
    backends: Vec<Arc<dyn Backend>>,
    unreadable: HashSet<String>,
}

impl Members {
    fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }
}

/// A named group of backends
///
/// Writes go to every backend, or to the hosts of each point's tag shard when the route is
/// tag-sharded. Queries go to one readable backend, chosen round-robin and falling over to the
/// next one on network errors.
#[derive(Debug)]
pub struct Cluster {
    name: String,
    registry: Arc<dyn BackendRegistry>,
    members: RwLock<Arc<Members>>,
    tags: Arc<TagInfoManager>,
    balance: BalanceCounter,
    metrics: ClusterMetrics,
    _watch: DropGuard,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// The lines of `points` copied out of `payload`
fn collect_lines<'a>(payload: &[u8], points: impl IntoIterator<Item = &'a Point>) -> Bytes {
    let mut body = BytesMut::new();
    for point in points {
        body.extend_from_slice(point.line(payload));
    }
    body.freeze()
}

/// Tag values of the `dimensions` header, a JSON object of tag name to value
fn parse_dimensions(tag_names: &[String], dimensions: &str) -> Result<HashMap<String, String>> {
    let tags: HashMap<String, String> =
        serde_json::from_str(dimensions).map_err(|e| Error::InvalidDimensions(e.to_string()))?;
    if let Some(missing) = tag_names.iter().find(|name| !tags.contains_key(*name)) {
        return Err(Error::InvalidDimensions(format!("missing tag {missing}")));
    }
    Ok(tags)
}

impl Cluster {
    /// Build the cluster and start following its tag records
    pub async fn new(name: impl Into<String>, info: &ClusterInfo, ctx: &ClusterContext) -> Result<Self> {
        let name = name.into();
        let members = Self::resolve(ctx.registry.as_ref(), info)?;

        let tags = Arc::new(TagInfoManager::new(
            name.clone(),
            ctx.store.clone(),
            Arc::clone(&ctx.registry),
            DEFAULT_REPLICAS,
            members.names(),
        ));
        tags.refresh().await?;
        let token = ctx.tasks.child_token();
        tags.spawn_watch(&ctx.tasks, token.clone());

        debug!(cluster = %name, backends = ?members.names(), "cluster created");
        Ok(Self {
            name,
            registry: Arc::clone(&ctx.registry),
            members: RwLock::new(Arc::new(members)),
            tags,
            balance: BalanceCounter::default(),
            metrics: ctx.metrics.clone(),
            _watch: token.drop_guard(),
        })
    }

    fn resolve(registry: &dyn BackendRegistry, info: &ClusterInfo) -> Result<Members> {
        Ok(Members {
            backends: registry.backends(&info.host_list)?,
            unreadable: info.unreadable_host_list.iter().cloned().collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.members().names()
    }

    pub fn tags(&self) -> &Arc<TagInfoManager> {
        &self.tags
    }

    pub(crate) fn members(&self) -> Arc<Members> {
        Arc::clone(&self.members.read())
    }

    /// Look up the backends of `info` without applying them
    pub(crate) fn prepare(&self, info: &ClusterInfo) -> Result<Arc<Members>> {
        Self::resolve(self.registry.as_ref(), info).map(Arc::new)
    }

    pub(crate) fn install(&self, members: Arc<Members>) {
        self.tags.reset(members.names());
        *self.members.write() = members;
    }

    /// Replace the membership in place
    pub fn reset(&self, info: &ClusterInfo) -> Result<()> {
        let members = self.prepare(info)?;
        self.install(members);
        debug!(cluster = %self.name, "cluster reset");
        Ok(())
    }

    /// Write the lines of `points`, which index into `payload`
    pub async fn write(
        &self,
        params: &WriteParams,
        payload: &[u8],
        points: &[Point],
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        let db = params.db.as_str();
        self.metrics
            .request(&self.name, Action::Write, Outcome::Received, db);

        let result = if tag_names.is_empty() {
            let members = self.members();
            let body = collect_lines(payload, points);
            self.send_into_backends(&members.backends, params, body, headers)
                .await
        } else {
            self.write_by_tags(params, payload, points, tag_names, headers)
                .await
        };

        if let Err(e) = &result {
            error!(cluster = %self.name, %db, error = %e, "write failed");
        }
        self.metrics
            .request(&self.name, Action::Write, Outcome::of(&result), db);
        result
    }

    async fn write_by_tags(
        &self,
        params: &WriteParams,
        payload: &[u8],
        points: &[Point],
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        let mut groups: BTreeMap<String, Vec<&Point>> = BTreeMap::new();
        for point in points {
            let key = tag_key(&params.db, &point.measurement, tag_names, |name| {
                point.tag_value(name)
            });
            groups.entry(key).or_default().push(point);
        }
        debug!(cluster = %self.name, groups = groups.len(), "points grouped by tag key");

        let sends = groups.into_iter().map(|(key, group)| async move {
            let backends = self.tags.write_backends(&key).inspect_err(|e| {
                error!(cluster = %self.name, %key, error = %e, "get backends by tag key failed");
            })?;
            let body = collect_lines(payload, group);
            self.send_into_backends(&backends, params, body, headers)
                .await
        });

        let mut response = None;
        let mut failure = None;
        for result in join_all(sends).await {
            match result {
                Ok(r) => response = Some(r),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(response.unwrap_or_else(|| Response::new(StatusCode::NO_CONTENT, "")))
    }

    /// Send `body` to all `backends` concurrently
    ///
    /// Any backend error fails the write. Otherwise a non-2xx answer is returned in preference
    /// to a successful one.
    async fn send_into_backends(
        &self,
        backends: &[Arc<dyn Backend>],
        params: &WriteParams,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let db = params.db.as_str();
        let sends = backends.iter().map(|backend| {
            let body = body.clone();
            self.metrics
                .backend(&self.name, backend.name(), Action::Write, Outcome::Send, db);
            async move { (backend, backend.write(params, body, headers).await) }
        });

        let mut failure = None;
        let mut rejected = None;
        let mut accepted = None;
        for (backend, result) in join_all(sends).await {
            self.metrics.backend(
                &self.name,
                backend.name(),
                Action::Write,
                Outcome::of(&result),
                db,
            );
            match result {
                Ok(response) if response.is_success() => accepted = Some(response),
                Ok(response) => {
                    warn!(cluster = %self.name, backend = %backend.name(), %response, "write answered with error status");
                    rejected = Some(response);
                }
                Err(e) => {
                    error!(cluster = %self.name, backend = %backend.name(), error = %e, "write to backend failed");
                    failure = Some(e);
                }
            }
        }

        if let Some(source) = failure {
            return Err(Error::WriteFailed {
                cluster: self.name.clone(),
                source,
            });
        }
        rejected
            .or(accepted)
            .ok_or_else(|| Error::NoAvailableBackend(self.name.clone()))
    }

    /// Try the readable `backends` one after the other, starting at the round-robin position
    /// of `key`
    async fn round_robin<F, Fut>(
        &self,
        members: &Members,
        key: &str,
        backends: &[Arc<dyn Backend>],
        action: Action,
        db: &str,
        send: F,
    ) -> Result<Response>
    where
        F: Fn(Arc<dyn Backend>) -> Fut + Send + Sync,
        Fut: Future<Output = proxy_backend::Result<Response>> + Send,
    {
        let start = self.balance.next(key);
        let len = backends.len();
        for offset in 0..len {
            let backend = &backends[start.wrapping_add(offset) % len];
            if members.unreadable.contains(backend.name()) {
                debug!(cluster = %self.name, backend = %backend.name(), "backend is in the unreadable list");
                continue;
            }
            if !backend.readable() {
                warn!(cluster = %self.name, backend = %backend.name(), "backend not ready to be read");
                continue;
            }

            self.metrics
                .backend(&self.name, backend.name(), action, Outcome::Send, db);
            let result = send(Arc::clone(backend)).await;
            self.metrics
                .backend(&self.name, backend.name(), action, Outcome::of(&result), db);
            match result {
                Ok(response) => {
                    if !response.is_success() {
                        warn!(cluster = %self.name, backend = %backend.name(), %response, "query answered with error status");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    error!(cluster = %self.name, backend = %backend.name(), error = %e, "query failed, trying next backend");
                }
                Err(source) => {
                    return Err(Error::QueryFailed {
                        cluster: self.name.clone(),
                        source,
                    });
                }
            }
        }
        Err(Error::NoAvailableBackend(self.name.clone()))
    }

    async fn query_backends(
        &self,
        members: &Members,
        key: &str,
        backends: &[Arc<dyn Backend>],
        params: &QueryParams,
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.round_robin(members, key, backends, Action::Query, &params.db, |backend| async move {
            backend.query(params, headers).await
        })
        .await
    }

    /// Run a select on one backend, the one holding the tag shard named in its WHERE clause if
    /// the route is tag-sharded
    pub async fn query(
        &self,
        params: &QueryParams,
        measurement: &str,
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.metrics
            .request(&self.name, Action::Query, Outcome::Received, &params.db);
        let result = self
            .query_inner(params, measurement, tag_names, headers)
            .await;
        if let Err(e) = &result {
            error!(cluster = %self.name, db = %params.db, sql = %params.sql, error = %e, "query failed");
        }
        self.metrics
            .request(&self.name, Action::Query, Outcome::of(&result), &params.db);
        result
    }

    async fn query_inner(
        &self,
        params: &QueryParams,
        measurement: &str,
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        let members = self.members();
        if tag_names.is_empty() {
            return self
                .query_backends(&members, "", &members.backends, params, headers)
                .await;
        }

        let tags =
            proxy_influxql::select_tags(tag_names, &params.sql).map_err(Error::GetTagValueFailed)?;
        let key = tag_key(&params.db, measurement, tag_names, |name| {
            tags.iter()
                .find(|(tag, _)| tag == name)
                .map(|(_, value)| value.as_str())
        });
        debug!(cluster = %self.name, %key, "query by tag key");
        let backends = self.tags.read_backends(&key)?;
        self.query_backends(&members, &key, &backends, params, headers)
            .await
    }

    /// Run a `show` statement, asking every tag shard of the measurement and merging the
    /// answers if the route is tag-sharded
    pub async fn query_info(
        &self,
        params: &QueryParams,
        measurement: &str,
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        self.metrics
            .request(&self.name, Action::Query, Outcome::Received, &params.db);
        let result = self
            .query_info_inner(params, measurement, tag_names, headers)
            .await;
        if let Err(e) = &result {
            error!(cluster = %self.name, db = %params.db, sql = %params.sql, error = %e, "query info failed");
        }
        self.metrics
            .request(&self.name, Action::Query, Outcome::of(&result), &params.db);
        result
    }

    async fn query_info_inner(
        &self,
        params: &QueryParams,
        measurement: &str,
        tag_names: &[String],
        headers: &HeaderMap,
    ) -> Result<Response> {
        let members = self.members();
        if tag_names.is_empty() {
            return self
                .query_backends(&members, "", &members.backends, params, headers)
                .await;
        }

        let keys = self
            .tags
            .read_keys(&format!("{}/{measurement}", params.db));
        let mut responses = Vec::with_capacity(keys.len());
        for key in keys {
            let backends = self.tags.read_backends(&key)?;
            responses.push(
                self.query_backends(&members, &key, &backends, params, headers)
                    .await?,
            );
        }
        merge_infos(responses)
    }

    /// Create the database on every backend
    pub async fn create_database(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response> {
        let db = params.db.as_str();
        self.metrics
            .request(&self.name, Action::CreateDatabase, Outcome::Received, db);

        let members = self.members();
        let sends = members.backends.iter().map(|backend| {
            self.metrics.backend(
                &self.name,
                backend.name(),
                Action::CreateDatabase,
                Outcome::Send,
                db,
            );
            async move { (backend, backend.create_database(params, headers).await) }
        });

        let mut failure = None;
        let mut rejected = None;
        let mut last = None;
        for (backend, result) in join_all(sends).await {
            self.metrics.backend(
                &self.name,
                backend.name(),
                Action::CreateDatabase,
                Outcome::of(&result),
                db,
            );
            match result {
                Ok(response) if response.is_success() => last = Some(response),
                Ok(response) => {
                    warn!(cluster = %self.name, backend = %backend.name(), %response, "create database answered with error status");
                    rejected = Some(response);
                }
                Err(e) => {
                    error!(cluster = %self.name, backend = %backend.name(), sql = %params.sql, error = %e, "create database failed");
                    failure = Some(e);
                }
            }
        }

        let result = match failure {
            Some(source) => Err(Error::CreateDatabaseFailed {
                cluster: self.name.clone(),
                source,
            }),
            None => rejected
                .or(last)
                .ok_or_else(|| Error::NoAvailableBackend(self.name.clone())),
        };
        self.metrics
            .request(&self.name, Action::CreateDatabase, Outcome::of(&result), db);
        result
    }

    /// Forward a Flux query to one backend
    ///
    /// The `db` and `measurement` headers name the route; tag-sharded routes also need the
    /// `dimensions` header carrying the tag values as a JSON object.
    pub async fn raw_query(
        &self,
        body: Bytes,
        headers: &HeaderMap,
        tag_names: &[String],
    ) -> Result<Response> {
        let db = header_str(headers, "db");
        self.metrics
            .request(&self.name, Action::RawQuery, Outcome::Received, db);
        let result = self.raw_query_inner(body, headers, tag_names).await;
        if let Err(e) = &result {
            error!(cluster = %self.name, %db, error = %e, "raw query failed");
        }
        self.metrics
            .request(&self.name, Action::RawQuery, Outcome::of(&result), db);
        result
    }

    async fn raw_query_inner(
        &self,
        body: Bytes,
        headers: &HeaderMap,
        tag_names: &[String],
    ) -> Result<Response> {
        let db = header_str(headers, "db");
        let members = self.members();

        let (key, backends) = if tag_names.is_empty() {
            (String::new(), members.backends.clone())
        } else {
            let dimensions = header_str(headers, "dimensions");
            if dimensions.is_empty() {
                return Err(Error::MissingRequiredDimensions);
            }
            let tags = parse_dimensions(tag_names, dimensions)?;
            let measurement = header_str(headers, "measurement");
            let key = tag_key(db, measurement, tag_names, |name| {
                tags.get(name).map(String::as_str)
            });
            let backends = self.tags.read_backends(&key)?;
            (key, backends)
        };

        self.round_robin(&members, &key, &backends, Action::RawQuery, db, |backend| {
            let body = body.clone();
            async move { backend.raw_query(body, headers).await }
        })
        .await
    }
}

impl Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members = self.members();
        let mut unreadable = members.unreadable.iter().collect::<Vec<_>>();
        unreadable.sort();
        write!(
            f,
            "influxdb_cluster:[{}],backend_list:{:?},unreadable_host:{:?},{}",
            self.name,
            members.names(),
            unreadable,
            self.tags
        )
    }
}
