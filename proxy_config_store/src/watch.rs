use std::{cmp::Ordering, sync::Arc, time::Duration};

use proxy_shutdown::BackgroundTasks;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{ConfigStore, KvPair, Result};

/// Emitted by [`watch_change`] when there are no content paths to hash
pub const CHANGED_SENTINEL: &str = "changed";

/// Pause before the next watch attempt after the store failed
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Order pairs by key, byte-wise, with the longer key first when one key is a prefix of the other
///
/// Replicas reading the same data must hash it identically.
pub fn sort_pairs(pairs: &mut [KvPair]) {
    pairs.sort_by(|a, b| compare_keys(a.key.as_bytes(), b.key.as_bytes()));
}

fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    match a.iter().zip(b).map(|(x, y)| x.cmp(y)).find(|o| o.is_ne()) {
        Some(ordering) => ordering,
        None => b.len().cmp(&a.len()),
    }
}

/// Read every pair under `paths` and hash them in a deterministic order
pub async fn content_hash(store: &dyn ConfigStore, paths: &[String]) -> Result<String> {
    let mut pairs = Vec::new();
    for path in paths {
        pairs.extend(store.get_prefix(path).await?);
    }
    sort_pairs(&mut pairs);

    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.key.as_bytes());
        hasher.update([0]);
        hasher.update(&pair.value);
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Watch `watch_path` and emit the hash of `content_paths` after every change
///
/// The first value is emitted as soon as the store answers. With no content paths every change
/// emits [`CHANGED_SENTINEL`]. Store errors are logged and retried; the loop ends when `tasks`
/// is cancelled or the receiver is dropped.
pub fn watch_change(
    store: Arc<dyn ConfigStore>,
    watch_path: String,
    content_paths: Vec<String>,
    tasks: &BackgroundTasks,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    let token = tasks.cancellation_token();

    tasks.spawn(async move {
        let mut index = 0;
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = store.wait_for_change(&watch_path, index) => next,
            };
            let value = match next {
                Ok(next) => {
                    index = next;
                    if content_paths.is_empty() {
                        Ok(CHANGED_SENTINEL.to_string())
                    } else {
                        content_hash(store.as_ref(), &content_paths).await
                    }
                }
                Err(e) => Err(e),
            };

            match value {
                Ok(value) => {
                    debug!(%watch_path, index, %value, "store change observed");
                    let sent = tokio::select! {
                        _ = token.cancelled() => break,
                        sent = tx.send(value) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    warn!(%watch_path, %error, "watching store failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
        debug!(%watch_path, "store watch stopped");
    });

    rx
}
