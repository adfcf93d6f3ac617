use std::{any::Any, fmt::Debug, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::FutureExt;
use http::header::AUTHORIZATION;
use hyper::{Body, Method, Request, Response};
use tracing::{debug, error, warn};

use crate::{
    Error, Result,
    handlers::{Handler, request_db},
    service::ProxyService,
};

/// One step in front of an endpoint handler
#[async_trait]
pub(crate) trait Middleware: Debug + Send + Sync + 'static {
    async fn call(
        &self,
        service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>>;
}

/// The middleware of one endpoint, composed once
///
/// The last middleware added is the outermost and runs first.
#[derive(Debug, Default)]
pub(crate) struct Chain {
    middlewares: Vec<Box<dyn Middleware>>,
}

impl Chain {
    pub(crate) fn with(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    pub(crate) async fn run(
        &self,
        service: &ProxyService,
        path: &'static str,
        handler: Handler,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        Next {
            service,
            path,
            handler,
            middlewares: &self.middlewares,
        }
        .run(req)
        .await
    }
}

/// The rest of a chain, handed to each middleware
#[derive(Debug, Clone, Copy)]
pub(crate) struct Next<'a> {
    service: &'a ProxyService,
    path: &'static str,
    handler: Handler,
    middlewares: &'a [Box<dyn Middleware>],
}

impl Next<'_> {
    pub(crate) fn path(&self) -> &'static str {
        self.path
    }

    pub(crate) async fn run(self, req: Request<Body>) -> Result<Response<Body>> {
        match self.middlewares.split_last() {
            Some((outer, rest)) => {
                let next = Next {
                    middlewares: rest,
                    ..self
                };
                outer.call(self.service, req, next).await
            }
            None => self.service.handle(self.handler, req).await,
        }
    }
}

/// Turns a panic anywhere below it into a 500
#[derive(Debug)]
pub(crate) struct Recover;

#[async_trait]
impl Middleware for Recover {
    async fn call(
        &self,
        service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        let db = request_db(&req);
        let uri = req.uri().clone();
        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                service.metrics().panic(next.path());
                error!(
                    %uri,
                    %db,
                    panic = %message,
                    backtrace = ?backtrace::Backtrace::new(),
                    "panic while handling request"
                );
                Err(Error::Panic(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Holds the global lock for the duration of the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    /// Traffic, runs alongside other shared requests
    Shared,
    /// Administration, runs alone
    Exclusive,
}

#[async_trait]
impl Middleware for Gate {
    async fn call(
        &self,
        service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        match self {
            Self::Shared => {
                let _guard = service.gate().read().await;
                next.run(req).await
            }
            Self::Exclusive => {
                let _guard = service.gate().write().await;
                next.run(req).await
            }
        }
    }
}

/// Counts requests per endpoint and database
#[derive(Debug)]
pub(crate) struct Received;

#[async_trait]
impl Middleware for Received {
    async fn call(
        &self,
        service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        service.metrics().received(next.path(), &request_db(&req));
        next.run(req).await
    }
}

/// Rejects traffic while the proxy is not available
#[derive(Debug)]
pub(crate) struct Available;

#[async_trait]
impl Middleware for Available {
    async fn call(
        &self,
        service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        if !service.is_available() {
            warn!(path = next.path(), "request rejected, proxy not ready");
            return Err(Error::NotReady);
        }
        next.run(req).await
    }
}

/// Checks the basic auth credentials when configured, and strips them before forwarding
#[derive(Debug)]
pub(crate) struct BasicAuth;

#[async_trait]
impl Middleware for BasicAuth {
    async fn call(
        &self,
        service: &ProxyService,
        mut req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        if let Some(credentials) = &service.generation().config.basic_auth {
            credentials.verify(req.headers()).map_err(|e| {
                debug!(path = next.path(), error = %e, "basic auth rejected");
                Error::Unauthenticated(e)
            })?;
        }
        req.headers_mut().remove(AUTHORIZATION);
        next.run(req).await
    }
}

/// Checks the static admin token
#[derive(Debug)]
pub(crate) struct AdminAuth;

#[async_trait]
impl Middleware for AdminAuth {
    async fn call(
        &self,
        service: &ProxyService,
        mut req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        service
            .generation()
            .admin_token
            .verify(req.headers())
            .map_err(|e| {
                warn!(path = next.path(), error = %e, "admin request rejected");
                Error::Unauthenticated(e)
            })?;
        req.headers_mut().remove(AUTHORIZATION);
        next.run(req).await
    }
}

/// Rejects methods other than the listed ones
#[derive(Debug)]
pub(crate) struct AllowMethods(pub(crate) &'static [Method]);

#[async_trait]
impl Middleware for AllowMethods {
    async fn call(
        &self,
        _service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        if !self.0.contains(req.method()) {
            debug!(path = next.path(), method = %req.method(), "method not allowed");
            return Err(Error::WrongMethod);
        }
        next.run(req).await
    }
}

/// Requires the `db` query parameter to be a single word
#[derive(Debug)]
pub(crate) struct SingleWordDb;

#[async_trait]
impl Middleware for SingleWordDb {
    async fn call(
        &self,
        _service: &ProxyService,
        req: Request<Body>,
        next: Next<'_>,
    ) -> Result<Response<Body>> {
        let db = request_db(&req);
        if !is_single_word(&db) {
            warn!(%db, "bad db name");
            return Err(Error::BadDbName);
        }
        next.run(req).await
    }
}

pub(crate) fn is_single_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
