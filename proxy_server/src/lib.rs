//! The HTTP surface of the proxy and the lifecycle of its configuration
//!
//! [`ProxyService`] owns one generation of managers built from the static configuration, keeps
//! them in step with the config store through its watch loop and answers the InfluxDB 1.x API
//! on top of them. Every endpoint runs behind an ordered chain of middleware that gates it on
//! the global lock, availability, credentials and method.
use std::{convert::Infallible, sync::Arc};

use http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use hyper::{
    Body, Request, Response,
    server::conn::{AddrIncoming, AddrStream},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod auth;
mod body;
mod handlers;
mod metrics;
mod middleware;
mod service;

#[cfg(test)]
mod test_util;

pub use auth::{AuthError, BasicCredentials};
pub use body::ParseBodyError;
pub use service::{ConfigSource, HealthSettings, ProxyService, ServiceConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NoHandler,

    #[error("proxy not ready")]
    NotReady,

    #[error("authenticate failed")]
    Unauthenticated(#[source] AuthError),

    #[error("wrong method")]
    WrongMethod,

    #[error("bad db name")]
    BadDbName,

    #[error(transparent)]
    Body(#[from] ParseBodyError),

    #[error("invalid query string: {0}")]
    InvalidQueryString(#[from] serde_urlencoded::de::Error),

    #[error(transparent)]
    Route(#[from] proxy_route::Error),

    /// A raw query that could not be forwarded
    #[error("{0}")]
    RawQuery(#[source] proxy_route::Error),

    #[error("switch available failed,error:{0}")]
    Switch(#[source] proxy_config_store::Error),

    #[error("failed to load configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] proxy_config_store::Error),

    #[error(transparent)]
    Backend(#[from] proxy_backend::Error),

    #[error(transparent)]
    Cluster(#[from] proxy_cluster::Error),

    #[error("config watch stopped before the first change")]
    WatchClosed,

    #[error("no config from the store within {0:?}")]
    LoadTimeout(std::time::Duration),

    #[error(transparent)]
    Logging(#[from] proxy_trogging::Error),

    #[error("handler panicked: {0}")]
    Panic(String),

    #[error("hyper http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("error serving http: {0}")]
    ServingHttp(#[from] hyper::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoHandler => StatusCode::NOT_FOUND,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::WrongMethod => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadDbName | Self::Body(_) | Self::InvalidQueryString(_) => StatusCode::BAD_REQUEST,
            Self::Route(e) => e.status_code(),
            Self::NotReady
            | Self::RawQuery(_)
            | Self::Switch(_)
            | Self::Config(_)
            | Self::Store(_)
            | Self::Backend(_)
            | Self::Cluster(_)
            | Self::WatchClosed
            | Self::LoadTimeout(_)
            | Self::Logging(_)
            | Self::Panic(_)
            | Self::Http(_)
            | Self::ServingHttp(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The error as `{"results":[{"error":"<message>"}]}`
    pub fn response(&self) -> Response<Body> {
        let body = serde_json::json!({ "results": [{ "error": self.to_string() }] });
        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = self.status_code();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Serve the proxy API on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: AddrIncoming,
    service: Arc<ProxyService>,
    shutdown: CancellationToken,
) -> Result<(), hyper::Error> {
    hyper::Server::builder(addr)
        .serve(hyper::service::make_service_fn(|_conn: &AddrStream| {
            let service = Arc::clone(&service);
            let service = hyper::service::service_fn(move |request: Request<Body>| {
                handlers::route_request(Arc::clone(&service), request)
            });
            futures::future::ready(Ok::<_, Infallible>(service))
        }))
        .with_graceful_shutdown(shutdown.cancelled())
        .await
}
