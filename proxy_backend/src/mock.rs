//! Test doubles for [`Backend`] and [`BackendFactory`]
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use proxy_config_store::HostInfo;

use crate::{
    Backend, BackendFactory, BackendRegistry, Error, QueryParams, Response, Result, WriteParams,
};

const EMPTY_RESULT: &str = r#"{"results":[{"statement_id":0}]}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBackendCall {
    Write { params: WriteParams, body: Bytes },
    Query { params: QueryParams },
    CreateDatabase { params: QueryParams },
    RawQuery { body: Bytes },
    Ping,
}

#[derive(Debug, Default)]
struct State {
    info: HostInfo,
    readable: bool,
    calls: Vec<MockBackendCall>,
    resets: Vec<HostInfo>,
    write_return: VecDeque<Result<Response>>,
    query_return: VecDeque<Result<Response>>,
    create_database_return: VecDeque<Result<Response>>,
    raw_query_return: VecDeque<Result<Response>>,
}

/// A [`Backend`] recording its calls
///
/// Each operation answers with the queued results set by the `with_*_return` methods, in
/// order, and with a successful empty response once its queue is drained.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_info(name, &HostInfo::new("localhost", 8086))
    }

    pub fn with_info(name: impl Into<String>, info: &HostInfo) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                info: info.clone(),
                readable: info.readable,
                ..Default::default()
            }),
        }
    }

    pub fn with_write_return(self, ret: impl Into<VecDeque<Result<Response>>>) -> Self {
        self.state.lock().write_return = ret.into();
        self
    }

    pub fn with_query_return(self, ret: impl Into<VecDeque<Result<Response>>>) -> Self {
        self.state.lock().query_return = ret.into();
        self
    }

    pub fn with_create_database_return(self, ret: impl Into<VecDeque<Result<Response>>>) -> Self {
        self.state.lock().create_database_return = ret.into();
        self
    }

    pub fn with_raw_query_return(self, ret: impl Into<VecDeque<Result<Response>>>) -> Self {
        self.state.lock().raw_query_return = ret.into();
        self
    }

    pub fn set_readable(&self, readable: bool) {
        self.state.lock().readable = readable;
    }

    pub fn calls(&self) -> Vec<MockBackendCall> {
        self.state.lock().calls.clone()
    }

    /// The bodies of all writes received so far
    pub fn written(&self) -> Vec<Bytes> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockBackendCall::Write { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn resets(&self) -> Vec<HostInfo> {
        self.state.lock().resets.clone()
    }

    pub fn pings(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockBackendCall::Ping))
            .count()
    }
}

fn next_or(queue: &mut VecDeque<Result<Response>>, status: StatusCode, body: &'static str) -> Result<Response> {
    queue
        .pop_front()
        .unwrap_or_else(|| Ok(Response::new(status, body)))
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn disabled(&self) -> bool {
        self.state.lock().info.disabled
    }

    fn readable(&self) -> bool {
        self.state.lock().readable
    }

    fn reset(&self, info: &HostInfo) -> Result<()> {
        let mut state = self.state.lock();
        state.info = info.clone();
        state.readable = info.readable;
        state.resets.push(info.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock backend {}", self.name)
    }

    async fn write(&self, params: &WriteParams, body: Bytes, _headers: &HeaderMap) -> Result<Response> {
        let mut state = self.state.lock();
        state.calls.push(MockBackendCall::Write {
            params: params.clone(),
            body,
        });
        next_or(&mut state.write_return, StatusCode::NO_CONTENT, "")
    }

    async fn query(&self, params: &QueryParams, _headers: &HeaderMap) -> Result<Response> {
        let mut state = self.state.lock();
        state.calls.push(MockBackendCall::Query {
            params: params.clone(),
        });
        next_or(&mut state.query_return, StatusCode::OK, EMPTY_RESULT)
    }

    async fn create_database(&self, params: &QueryParams, _headers: &HeaderMap) -> Result<Response> {
        let mut state = self.state.lock();
        state.calls.push(MockBackendCall::CreateDatabase {
            params: params.clone(),
        });
        next_or(&mut state.create_database_return, StatusCode::OK, EMPTY_RESULT)
    }

    async fn raw_query(&self, body: Bytes, _headers: &HeaderMap) -> Result<Response> {
        let mut state = self.state.lock();
        state.calls.push(MockBackendCall::RawQuery { body });
        next_or(&mut state.raw_query_return, StatusCode::OK, "")
    }

    async fn ping(&self) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.calls.push(MockBackendCall::Ping);
        state.readable = true;
        Ok(Some("mock".to_string()))
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    made: Vec<String>,
    backends: BTreeMap<String, Arc<MockBackend>>,
    failing: BTreeSet<String>,
}

/// A [`BackendFactory`] handing out [`MockBackend`]s and keeping them for inspection
#[derive(Debug, Default)]
pub struct MockBackendFactory {
    state: Mutex<FactoryState>,
}

impl MockBackendFactory {
    /// Fail to create the backend called `name`
    pub fn with_failing(self, name: impl Into<String>) -> Self {
        self.state.lock().failing.insert(name.into());
        self
    }

    /// Names of all backends created, in creation order
    pub fn made(&self) -> Vec<String> {
        self.state.lock().made.clone()
    }

    /// The most recent backend created for `name`
    pub fn backend(&self, name: &str) -> Option<Arc<MockBackend>> {
        self.state.lock().backends.get(name).map(Arc::clone)
    }
}

impl BackendFactory for MockBackendFactory {
    fn make(&self, name: &str, info: &HostInfo) -> Result<Arc<dyn Backend>> {
        let mut state = self.state.lock();
        if state.failing.contains(name) {
            return Err(Error::Network {
                backend: name.to_string(),
                message: "mock failure".to_string(),
            });
        }
        let backend = Arc::new(MockBackend::with_info(name, info));
        state.made.push(name.to_string());
        state.backends.insert(name.to_string(), Arc::clone(&backend));
        Ok(backend)
    }
}

/// A [`BackendRegistry`] over a fixed set of [`MockBackend`]s
#[derive(Debug, Default)]
pub struct MockRegistry {
    backends: Mutex<BTreeMap<String, Arc<MockBackend>>>,
}

impl MockRegistry {
    pub fn with_backend(self, backend: MockBackend) -> Self {
        self.insert(Arc::new(backend));
        self
    }

    /// Register `backend`, replacing any backend of the same name
    pub fn insert(&self, backend: Arc<MockBackend>) {
        self.backends
            .lock()
            .insert(backend.name().to_string(), backend);
    }

    pub fn backend(&self, name: &str) -> Option<Arc<MockBackend>> {
        self.backends.lock().get(name).map(Arc::clone)
    }
}

impl BackendRegistry for MockRegistry {
    fn backends(&self, names: &[String]) -> Result<Vec<Arc<dyn Backend>>> {
        let backends = self.backends.lock();
        let mut found: Vec<Arc<dyn Backend>> = Vec::with_capacity(names.len());
        let mut missing = vec![];
        for name in names {
            match backends.get(name) {
                Some(backend) if backend.disabled() => {}
                Some(backend) => found.push(Arc::clone(backend) as _),
                None => missing.push(name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::BackendNotExist(missing));
        }
        Ok(found)
    }
}
