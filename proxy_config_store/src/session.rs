//! Session-scoped distributed locks
use std::{sync::Arc, time::Duration};

use proxy_shutdown::BackgroundTasks;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ConfigStore, Result};

/// Renew `session` every `interval` until `token` is cancelled
pub fn spawn_session_renewal(
    store: Arc<dyn ConfigStore>,
    session: String,
    interval: Duration,
    token: CancellationToken,
    tasks: &BackgroundTasks,
) {
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match store.renew_session(&session).await {
                Ok(()) => debug!(%session, "renewed store session"),
                Err(error) => warn!(%session, %error, "failed to renew store session"),
            }
        }
        debug!(%session, "session renewal stopped");
    });
}

/// A lock held in the store by a renewed session
///
/// Dropping the lock without [`release`][Self::release] stops renewal, letting the session expire.
#[derive(Debug)]
pub struct DistributedLock {
    store: Arc<dyn ConfigStore>,
    path: String,
    session: String,
    renewal: CancellationToken,
}

impl DistributedLock {
    /// Create a session with `ttl`, renew it every `renew_every` and try to take the lock at `path`
    ///
    /// Returns `None` if another session holds the lock.
    pub async fn acquire(
        store: Arc<dyn ConfigStore>,
        path: impl Into<String>,
        ttl: Duration,
        renew_every: Duration,
        tasks: &BackgroundTasks,
    ) -> Result<Option<Self>> {
        let path = path.into();
        let session = store.new_session(ttl).await?;
        let renewal = tasks.child_token();
        spawn_session_renewal(
            Arc::clone(&store),
            session.clone(),
            renew_every,
            renewal.clone(),
            tasks,
        );

        match store.acquire(&path, &session).await {
            Ok(true) => {
                info!(%path, %session, "acquired distributed lock");
                Ok(Some(Self {
                    store,
                    path,
                    session,
                    renewal,
                }))
            }
            Ok(false) => {
                renewal.cancel();
                Ok(None)
            }
            Err(e) => {
                renewal.cancel();
                Err(e)
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Release the lock and stop renewing its session
    pub async fn release(self) -> Result<()> {
        self.renewal.cancel();
        let released = self.store.release(&self.path, &self.session).await?;
        if released {
            info!(path = %self.path, "released distributed lock");
        } else {
            warn!(path = %self.path, "distributed lock was no longer held");
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        self.renewal.cancel();
    }
}
