//! An in-process [`ConfigStore`], used by tests and single-node deployments
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    ConfigStore, Error, KvPair, Result, format_prefix,
    health::{CheckStatus, HealthCheck, ServiceRegistration},
};

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    modify_index: u64,
    session: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    sessions: BTreeSet<String>,
    next_session: u64,
    index: u64,
    services: BTreeMap<String, ServiceRegistration>,
    checks: BTreeMap<String, CheckStatus>,
}

impl State {
    /// Bump the global index after a mutation and return it
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn last_index_under(&self, prefix: &str) -> u64 {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, e)| e.modify_index)
            .max()
            .unwrap_or(0)
    }
}

/// A [`ConfigStore`] that keeps everything in memory
///
/// Change indexes are global: every mutation bumps one counter, and waiters on a prefix wake
/// when an entry under the prefix carries an index newer than the one they saw.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            changes,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with [`Error::Unavailable`] until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The registered service with the given id
    pub fn service(&self, id: &str) -> Option<ServiceRegistration> {
        self.state.lock().services.get(id).cloned()
    }

    /// The last reported status of a check
    pub fn check_status(&self, check_id: &str) -> Option<CheckStatus> {
        self.state.lock().checks.get(check_id).copied()
    }

    /// The session currently holding the lock at `path`
    pub fn lock_holder(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .get(path)
            .and_then(|e| e.session.clone())
    }

    fn available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    fn notify(&self, index: u64) {
        self.changes.send_replace(index);
    }

    fn write(&self, path: &str, value: Bytes) {
        let index = {
            let mut state = self.state.lock();
            let index = state.bump();
            let session = state.entries.get(path).and_then(|e| e.session.clone());
            state.entries.insert(
                path.to_string(),
                Entry {
                    value,
                    modify_index: index,
                    session,
                },
            );
            index
        };
        self.notify(index);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        self.available()?;
        Ok(self.state.lock().entries.get(path).map(|e| e.value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.available()?;
        let prefix = format_prefix(prefix);
        let state = self.state.lock();
        Ok(state
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, e)| KvPair::new(k.clone(), e.value.clone()))
            .collect())
    }

    async fn get_child(&self, prefix: &str) -> Result<Vec<String>> {
        self.available()?;
        let prefix = format_prefix(prefix);
        let state = self.state.lock();
        let children: BTreeSet<String> = state
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                if rest.is_empty() {
                    return None;
                }
                Some(match rest.find('/') {
                    Some(pos) => format!("{prefix}{}", &rest[..=pos]),
                    None => k.clone(),
                })
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn put(&self, path: &str, value: Bytes) -> Result<()> {
        self.available()?;
        self.write(path, value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.available()?;
        let index = {
            let mut state = self.state.lock();
            if state.entries.remove(path).is_none() {
                return Ok(());
            }
            state.bump()
        };
        self.notify(index);
        Ok(())
    }

    async fn cas(&self, path: &str, previous: Option<&[u8]>, value: Bytes) -> Result<bool> {
        self.available()?;
        let index = {
            let mut state = self.state.lock();
            let matches = match (state.entries.get(path), previous) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(entry), Some(previous)) => entry.value.as_ref() == previous,
            };
            if !matches {
                return Ok(false);
            }
            let index = state.bump();
            let session = state.entries.get(path).and_then(|e| e.session.clone());
            state.entries.insert(
                path.to_string(),
                Entry {
                    value,
                    modify_index: index,
                    session,
                },
            );
            index
        };
        self.notify(index);
        Ok(true)
    }

    async fn new_session(&self, _ttl: Duration) -> Result<String> {
        self.available()?;
        let mut state = self.state.lock();
        state.next_session += 1;
        let id = format!("session-{}", state.next_session);
        state.sessions.insert(id.clone());
        Ok(id)
    }

    async fn renew_session(&self, session: &str) -> Result<()> {
        self.available()?;
        if self.state.lock().sessions.contains(session) {
            Ok(())
        } else {
            Err(Error::SessionNotFound(session.to_string()))
        }
    }

    async fn acquire(&self, path: &str, session: &str) -> Result<bool> {
        self.available()?;
        let index = {
            let mut state = self.state.lock();
            if !state.sessions.contains(session) {
                return Err(Error::SessionNotFound(session.to_string()));
            }
            match state.entries.get(path).and_then(|e| e.session.as_deref()) {
                Some(holder) if holder != session => return Ok(false),
                _ => {}
            }
            let index = state.bump();
            let entry = state.entries.entry(path.to_string()).or_insert(Entry {
                value: Bytes::new(),
                modify_index: index,
                session: None,
            });
            entry.session = Some(session.to_string());
            entry.modify_index = index;
            index
        };
        self.notify(index);
        Ok(true)
    }

    async fn release(&self, path: &str, session: &str) -> Result<bool> {
        self.available()?;
        let index = {
            let mut state = self.state.lock();
            let index = state.index + 1;
            match state.entries.get_mut(path) {
                Some(entry) if entry.session.as_deref() == Some(session) => {
                    entry.session = None;
                    entry.modify_index = index;
                }
                _ => return Ok(false),
            }
            state.bump()
        };
        self.notify(index);
        Ok(true)
    }

    async fn wait_for_change(&self, prefix: &str, index: u64) -> Result<u64> {
        self.available()?;
        let mut changes = self.changes.subscribe();
        loop {
            let last = self.state.lock().last_index_under(prefix);
            if index == 0 || last > index {
                return Ok(last.max(1));
            }
            if changes.changed().await.is_err() {
                return Err(Error::Unavailable);
            }
            self.available()?;
        }
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<()> {
        self.available()?;
        self.state
            .lock()
            .services
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.available()?;
        let mut state = self.state.lock();
        if let Some(registration) = state.services.remove(service_id) {
            state.checks.remove(&registration.check_id);
        }
        Ok(())
    }

    async fn register_check(&self, registration: &ServiceRegistration) -> Result<()> {
        self.available()?;
        self.state
            .lock()
            .checks
            .insert(registration.check_id.clone(), CheckStatus::Critical);
        Ok(())
    }

    async fn update_check(&self, check_id: &str, status: CheckStatus) -> Result<()> {
        self.available()?;
        self.state.lock().checks.insert(check_id.to_string(), status);
        Ok(())
    }
}
