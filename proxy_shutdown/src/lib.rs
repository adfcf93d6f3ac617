//! Manage proxy shutdown and the lifetime of background tasks
//!
//! Two kinds of lifetimes exist in the proxy:
//!
//! # The process, coordinated by [`ShutdownManager`]
//!
//! When a shutdown is signaled externally, e.g., `ctrl+c`, components that hold state in the
//! config store (the health check registration, a held rebalance lock) need to clean up before
//! the HTTP frontend stops accepting requests. Components [`register`][ShutdownManager::register]
//! to receive a [`ShutdownToken`], [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown], and
//! signal back via [`complete`][ShutdownToken::complete].
//!
//! # A configuration generation, owned by [`BackgroundTasks`]
//!
//! The watch loop, the health heartbeat, per-cluster tag watchers and lock renewal all belong to
//! one generation of configuration. A reload cancels the generation and
//! [`waits`][BackgroundTasks::shutdown] for every task spawned in it before the next generation
//! starts, so two generations never run side by side.
use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        _ => {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received SIGINT");
}

/// Manage process shutdown
#[derive(Debug)]
pub struct ShutdownManager {
    frontend_shutdown: CancellationToken,
    backend_shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    ///
    /// Accepts a [`CancellationToken`] which the `ShutdownManager` will signal cancellation to
    /// after every registered component has completed its cleanup.
    pub fn new(frontend_shutdown: CancellationToken) -> Self {
        Self {
            frontend_shutdown,
            backend_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Create a [`ShutdownManager`] for testing purposes
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a component that needs to perform work before the process may exit
    ///
    /// The caller must invoke [`complete`][ShutdownToken::complete] on the returned token in
    /// order for process shutdown to proceed.
    pub fn register(&self) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(rx);
        ShutdownToken::new(self.backend_shutdown.clone(), tx)
    }

    /// Waits for registered components to complete before signaling shutdown to the frontend
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.frontend_shutdown.cancel();
    }

    /// Invoke process shutdown
    pub fn shutdown(&self) {
        self.backend_shutdown.cancel();
    }
}

/// A token that a component can obtain via [`register`][ShutdownManager::register]
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger process shutdown due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Future that completes when the [`ShutdownManager`] that issued this token is shutdown
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Signal back to the [`ShutdownManager`] that the owner of this token is finished cleaning
    /// up and it is safe for the process to exit
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}

/// The set of background tasks belonging to one configuration generation
///
/// Cloning is cheap and every clone refers to the same generation.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn a task tracked by this generation
    ///
    /// The task is expected to observe [`cancellation_token`][Self::cancellation_token] and return
    /// once it is cancelled; [`shutdown`][Self::shutdown] waits for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// The token cancelled when this generation ends
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token that is cancelled with this generation, or earlier by its holder
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the generation and wait for every task spawned in it to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("background tasks stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use crate::{BackgroundTasks, ShutdownManager};

    #[tokio::test]
    async fn test_shutdown_order() {
        let frontend_token = CancellationToken::new();
        let shutdown_manager = ShutdownManager::new(frontend_token.clone());

        static CLEAN: AtomicBool = AtomicBool::new(false);

        let token = shutdown_manager.register();
        tokio::spawn(async move {
            loop {
                futures::select! {
                    _ = token.wait_for_shutdown().fuse() => {
                        CLEAN.store(true, Ordering::SeqCst);
                        token.complete();
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)).fuse() => {}
                }
            }
        });

        shutdown_manager.shutdown();
        shutdown_manager.join().await;
        assert!(
            CLEAN.load(Ordering::SeqCst),
            "registered component did not complete"
        );
        assert!(
            frontend_token.is_cancelled(),
            "frontend shutdown was not triggered"
        );
    }

    #[test_log::test(tokio::test)]
    async fn background_tasks_are_drained_on_shutdown() {
        let tasks = BackgroundTasks::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let token = tasks.cancellation_token();
            let stopped = Arc::clone(&stopped);
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                stopped.fetch_add(1, Ordering::SeqCst);
            });
        }

        tasks.shutdown().await;
        assert!(tasks.is_cancelled());
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn child_token_follows_generation() {
        let tasks = BackgroundTasks::new();
        let child = tasks.child_token();
        child.cancel();
        assert!(!tasks.is_cancelled());

        let other = tasks.child_token();
        tasks.shutdown().await;
        assert!(other.is_cancelled());
    }
}
