use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use proxy_backend::{QueryParams, Response, WriteParams};
use proxy_influxql::{StatementKind, single_data_source, statement_kind};
use proxy_line_protocol::{Point, parse_points};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::{Error, MAX_CONCURRENT_ROUTES, Result, Route, RouteManager, route_key};

/// Collects the results of a write across routes
#[derive(Debug, Default)]
struct WriteOutcome {
    failure: Option<Error>,
    rejected: Option<Response>,
    success: Option<Response>,
}

impl WriteOutcome {
    fn record(&mut self, result: Result<Response>) {
        match result {
            Ok(response) if response.is_success() => {
                self.success.get_or_insert(response);
            }
            Ok(response) => {
                self.rejected.get_or_insert(response);
            }
            Err(e) => {
                self.failure.get_or_insert(e);
            }
        }
    }

    /// The write fails only when no route took its points
    fn finish(self) -> Result<Response> {
        match (self.rejected.or(self.success), self.failure) {
            (Some(response), failure) => {
                if let Some(e) = failure {
                    warn!(error = %e, "write partly failed");
                }
                Ok(response)
            }
            (None, Some(e)) => Err(e),
            (None, None) => Ok(Response::new(StatusCode::NO_CONTENT, "")),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

impl RouteManager {
    /// Write a line protocol payload, each point to the cluster of its `db.measurement` route
    ///
    /// The whole payload is parsed before anything is sent.
    pub async fn write(
        &self,
        params: &WriteParams,
        payload: Bytes,
        headers: &HeaderMap,
    ) -> Result<Response> {
        if payload.is_empty() {
            return Err(Error::EmptyData);
        }
        let payload = if payload.ends_with(b"\n") {
            payload
        } else {
            let mut buf = BytesMut::with_capacity(payload.len() + 1);
            buf.extend_from_slice(&payload);
            buf.extend_from_slice(b"\n");
            buf.freeze()
        };

        let mut batches = vec![];
        parse_points(&params.db, &payload, self.batch_size, |batch| {
            batches.push(batch)
        })
        .inspect_err(|e| error!(db = %params.db, error = %e, "parse write payload failed"))?;

        let semaphore = Semaphore::new(MAX_CONCURRENT_ROUTES);
        let mut outcome = WriteOutcome::default();
        let mut sends = vec![];
        for batch in batches {
            let mut groups: BTreeMap<String, Vec<Point>> = BTreeMap::new();
            for point in batch {
                groups
                    .entry(route_key(&point.db, &point.measurement))
                    .or_default()
                    .push(point);
            }

            for (key, points) in groups {
                match self.get_route(&key) {
                    Ok(route) => sends.push(write_route(
                        &semaphore, key, route, points, params, &payload, headers,
                    )),
                    Err(e) => {
                        error!(route = %key, error = %e, "no cluster for route");
                        outcome.record(Err(Error::MatchClusterByRouteFailed(key)));
                    }
                }
            }
        }

        for result in join_all(sends).await {
            outcome.record(result);
        }
        outcome.finish()
    }

    /// Run a query statement on the cluster its measurement routes to
    pub async fn query(&self, params: &QueryParams, headers: &HeaderMap) -> Result<Response> {
        let kind = statement_kind(&params.sql).map_err(|e| {
            warn!(db = %params.db, sql = %params.sql, error = %e, "unsupported statement");
            Error::SqlNotSupported
        })?;
        debug!(db = %params.db, %kind, "query");

        match kind {
            StatementKind::ShowDatabases => self.show_databases().await,
            StatementKind::Select => self.query_cluster(params, headers, false).await,
            StatementKind::ShowMeasurements
            | StatementKind::ShowSeries
            | StatementKind::ShowTagKeys
            | StatementKind::ShowTagValues
            | StatementKind::ShowFieldKeys => self.query_cluster(params, headers, true).await,
        }
    }

    async fn query_cluster(
        &self,
        params: &QueryParams,
        headers: &HeaderMap,
        info: bool,
    ) -> Result<Response> {
        let source = single_data_source(&params.sql)?;
        let mut params = params.clone();
        if !source.database.is_empty() {
            params.db = source.database;
        }

        let Route {
            cluster,
            tag_names,
        } = self.get_route(&route_key(&params.db, &source.table))?;
        let response = if info {
            cluster
                .query_info(&params, &source.table, &tag_names, headers)
                .await?
        } else {
            cluster
                .query(&params, &source.table, &tag_names, headers)
                .await?
        };
        if !response.is_success() {
            warn!(cluster = %cluster.name(), %response, "query answered with error status");
        }
        Ok(response)
    }

    /// Answer `show databases` with the databases that have routes
    async fn show_databases(&self) -> Result<Response> {
        let values = self
            .store
            .get_db_names()
            .await?
            .iter()
            .map(|name| format!("[{}]", serde_json::Value::from(name.as_str())))
            .collect::<Vec<_>>()
            .join(",");
        let body = format!(
            r#"{{"results":[{{"Series":[{{"name":"databases","columns":["name"],"values":[{values}]}}],"Messages":null}}]}}"#
        );
        let mut response = Response::new(StatusCode::OK, body);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }

    /// Create `db` on every backend of the cluster called `cluster`
    pub async fn create_database(
        &self,
        db: &str,
        cluster: &str,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let cluster = self.get_cluster_by_name(cluster)?;
        let params = QueryParams::new("", format!(r#"create database "{db}""#));
        let response = cluster.create_database(&params, headers).await?;
        if !response.is_success() {
            warn!(cluster = %cluster.name(), %db, %response, "create database answered with error status");
        }
        Ok(response)
    }

    /// Forward a raw query to the cluster named by the `db` and `measurement` headers
    pub async fn raw_query(&self, body: Bytes, headers: &HeaderMap) -> Result<Response> {
        let key = route_key(header_str(headers, "db"), header_str(headers, "measurement"));
        let route = self.get_route(&key)?;
        Ok(route
            .cluster
            .raw_query(body, headers, &route.tag_names)
            .await?)
    }
}

async fn write_route(
    semaphore: &Semaphore,
    key: String,
    route: Route,
    points: Vec<Point>,
    params: &WriteParams,
    payload: &[u8],
    headers: &HeaderMap,
) -> Result<Response> {
    let _permit = semaphore.acquire().await;
    let cluster = &route.cluster;
    let response = cluster
        .write(params, payload, &points, &route.tag_names, headers)
        .await
        .inspect_err(|e| {
            error!(route = %key, cluster = %cluster.name(), error = %e, "write to cluster failed");
        })?;
    if !response.is_success() {
        warn!(route = %key, cluster = %cluster.name(), %response, "write answered with error status");
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proxy_backend::mock::{MockBackend, MockBackendCall};
    use proxy_config_store::{ClusterInfo, RouteInfo};

    use http::HeaderName;

    use super::*;
    use crate::{DEFAULT_CLUSTER, test_util::Fixture};

    fn raw_headers(entries: &[(&'static str, &'static str)]) -> HeaderMap {
        entries
            .iter()
            .map(|(name, value)| {
                (
                    HeaderName::from_static(name),
                    HeaderValue::from_static(value),
                )
            })
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn write_goes_to_the_routed_cluster() {
        let fixture = Fixture::new(["h1", "h2"])
            .with_clusters(&[
                ("cl1", ClusterInfo::new(["h1"])),
                (DEFAULT_CLUSTER, ClusterInfo::new(["h2"])),
            ])
            .await;
        let manager = fixture.routes(&[("d1.m", RouteInfo::new("cl1"))]).await;

        let response = manager
            .write(
                &WriteParams::new("d1"),
                Bytes::from_static(b"m,t=1 f=1"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert_eq!(
            fixture.backend("h1").written(),
            vec![Bytes::from_static(b"m,t=1 f=1\n")]
        );
        assert!(fixture.backend("h2").calls().is_empty());
    }

    #[tokio::test]
    async fn write_groups_points_by_route() {
        let fixture = Fixture::new(["h1", "h2"])
            .with_clusters(&[
                ("cl1", ClusterInfo::new(["h1"])),
                ("cl2", ClusterInfo::new(["h2"])),
            ])
            .await;
        let manager = fixture
            .routes(&[
                ("d1.cpu", RouteInfo::new("cl1")),
                ("d1.mem", RouteInfo::new("cl2")),
            ])
            .await;

        manager
            .write(
                &WriteParams::new("d1"),
                Bytes::from_static(b"cpu,h=a v=1\nmem,h=a v=2\ncpu,h=b v=3\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            fixture.backend("h1").written(),
            vec![Bytes::from_static(b"cpu,h=a v=1\ncpu,h=b v=3\n")]
        );
        assert_eq!(
            fixture.backend("h2").written(),
            vec![Bytes::from_static(b"mem,h=a v=2\n")]
        );
    }

    #[tokio::test]
    async fn write_rejects_bad_payloads_before_sending() {
        let fixture = Fixture::new(["h1"])
            .with_clusters(&[("cl1", ClusterInfo::new(["h1"]))])
            .await;
        let manager = fixture.routes(&[("d1.m", RouteInfo::new("cl1"))]).await;
        let params = WriteParams::new("d1");

        let err = manager
            .write(&params, Bytes::new(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::EmptyData);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = manager
            .write(
                &params,
                Bytes::from_static(b"m,t=1 f=1\nm,t=1,t=2 f=1\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Parse(proxy_line_protocol::Error::DuplicateTags));
        assert!(fixture.backend("h1").calls().is_empty());
    }

    #[tokio::test]
    async fn write_fails_only_without_any_routed_cluster() {
        let fixture = Fixture::new(["h1"])
            .with_clusters(&[("cl1", ClusterInfo::new(["h1"]))])
            .await;
        let manager = fixture.routes(&[("d1.m", RouteInfo::new("cl1"))]).await;
        let params = WriteParams::new("d1");

        let response = manager
            .write(
                &params,
                Bytes::from_static(b"m,t=1 f=1\nother,t=1 f=1\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);

        let err = manager
            .write(&params, Bytes::from_static(b"other,t=1 f=1\n"), &HeaderMap::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::MatchClusterByRouteFailed(ref key) if key == "d1.other");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn write_prefers_error_status_over_success() {
        let fixture = Fixture::with_backends([
            MockBackend::new("h1"),
            MockBackend::new("h2").with_write_return([Ok(Response::new(
                StatusCode::BAD_REQUEST,
                r#"{"error":"field type conflict"}"#,
            ))]),
        ])
        .with_clusters(&[
            ("cl1", ClusterInfo::new(["h1"])),
            ("cl2", ClusterInfo::new(["h2"])),
        ])
        .await;
        let manager = fixture
            .routes(&[
                ("d1.cpu", RouteInfo::new("cl1")),
                ("d1.mem", RouteInfo::new("cl2")),
            ])
            .await;

        let response = manager
            .write(
                &WriteParams::new("d1"),
                Bytes::from_static(b"cpu,h=a v=1\nmem,h=a v=2\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn write_without_points_succeeds() {
        let fixture = Fixture::new(["h1"]);
        let manager = fixture.routes(&[]).await;
        let response = manager
            .write(
                &WriteParams::new("d1"),
                Bytes::from_static(b"# comment\n\n"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn select_uses_database_of_the_statement() {
        let fixture = Fixture::new(["h1", "h2"])
            .with_clusters(&[
                ("cl1", ClusterInfo::new(["h1"])),
                ("cl2", ClusterInfo::new(["h2"])),
            ])
            .await;
        let manager = fixture
            .routes(&[
                ("d1.cpu", RouteInfo::new("cl1")),
                ("d2.cpu", RouteInfo::new("cl2")),
            ])
            .await;

        let sql = "select * from d2..cpu";
        manager
            .query(&QueryParams::new("d1", sql), &HeaderMap::new())
            .await
            .unwrap();
        assert!(fixture.backend("h1").calls().is_empty());
        assert_eq!(
            fixture.backend("h2").calls(),
            vec![MockBackendCall::Query {
                params: QueryParams::new("d2", sql)
            }]
        );
    }

    #[tokio::test]
    async fn show_statements_go_to_the_cluster() {
        let fixture = Fixture::new(["h1"])
            .with_clusters(&[("cl1", ClusterInfo::new(["h1"]))])
            .await;
        let manager = fixture
            .routes(&[("d1.__default__", RouteInfo::new("cl1"))])
            .await;

        let response = manager
            .query(
                &QueryParams::new("d1", "show tag keys from cpu"),
                &HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fixture.backend("h1").calls().len(), 1);
    }

    #[tokio::test]
    async fn query_errors() {
        let fixture = Fixture::new(["h1"])
            .with_clusters(&[("cl1", ClusterInfo::new(["h1"]))])
            .await;
        let manager = fixture.routes(&[("d1.cpu", RouteInfo::new("cl1"))]).await;
        let headers = HeaderMap::new();

        let err = manager
            .query(&QueryParams::new("d1", "drop database d1"), &headers)
            .await
            .unwrap_err();
        assert_matches!(err, Error::SqlNotSupported);

        let err = manager
            .query(&QueryParams::new("d1", "select * from mem"), &headers)
            .await
            .unwrap_err();
        assert_matches!(err, Error::GetClusterFailed);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = manager
            .query(&QueryParams::new("d1", "select * from cpu, mem"), &headers)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Statement(_));
    }

    #[tokio::test]
    async fn show_databases_answers_from_the_store() {
        let fixture = Fixture::new([]);
        for (db, table) in [("db_b", "t1"), ("db_a", "t1"), ("db_a", "t2")] {
            fixture
                .store
                .put_route(db, table, &RouteInfo::new("cl1"))
                .await
                .unwrap();
        }
        let manager = fixture.routes(&[]).await;

        let response = manager
            .query(&QueryParams::new("", "show databases"), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(
            response.body_str(),
            r#"{"results":[{"Series":[{"name":"databases","columns":["name"],"values":[["db_a"],["db_b"]]}],"Messages":null}]}"#
        );
    }

    #[tokio::test]
    async fn create_database_on_named_cluster() {
        let fixture = Fixture::new(["h1", "h2"])
            .with_clusters(&[("cl1", ClusterInfo::new(["h1", "h2"]))])
            .await;
        let manager = fixture.routes(&[]).await;

        manager
            .create_database("d1", "cl1", &HeaderMap::new())
            .await
            .unwrap();
        for host in ["h1", "h2"] {
            assert_eq!(
                fixture.backend(host).calls(),
                vec![MockBackendCall::CreateDatabase {
                    params: QueryParams::new("", r#"create database "d1""#)
                }]
            );
        }

        assert_matches!(
            manager
                .create_database("d1", "cl9", &HeaderMap::new())
                .await,
            Err(Error::GetClusterFailed)
        );
    }

    #[tokio::test]
    async fn raw_query_routes_by_headers() {
        let fixture = Fixture::new(["h1", "h2"])
            .with_clusters(&[
                ("cl1", ClusterInfo::new(["h1"])),
                ("cl2", ClusterInfo::new(["h2"])),
            ])
            .await;
        let manager = fixture
            .routes(&[
                ("d1.cpu", RouteInfo::new("cl1")),
                ("d1.mem", RouteInfo::new("cl2")),
            ])
            .await;

        let body = Bytes::from_static(b"from(bucket: \"d1\")");
        manager
            .raw_query(
                body.clone(),
                &raw_headers(&[("db", "d1"), ("measurement", "mem")]),
            )
            .await
            .unwrap();
        assert!(fixture.backend("h1").calls().is_empty());
        assert_eq!(
            fixture.backend("h2").calls(),
            vec![MockBackendCall::RawQuery { body }]
        );
    }
}
