use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("backup is nil")]
pub struct BackupIsNil;

/// The live state of a manager plus an optional backup of an earlier state
///
/// Readers get an `Arc` of the current state and never block a swap for longer than the
/// pointer copy.
#[derive(Debug)]
pub struct Snapshot<T> {
    live: RwLock<Arc<T>>,
    backup: Mutex<Option<Arc<T>>>,
}

impl<T: Default> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            live: RwLock::new(Arc::new(value)),
            backup: Mutex::new(None),
        }
    }

    /// The current state
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.live.read())
    }

    /// Replace the current state
    pub fn store(&self, value: T) {
        self.swap(Arc::new(value));
    }

    pub fn swap(&self, value: Arc<T>) {
        *self.live.write() = value;
    }

    /// Remember the current state for a later [`Self::recover`]
    pub fn backup(&self) {
        *self.backup.lock() = Some(self.load());
    }

    pub fn has_backup(&self) -> bool {
        self.backup.lock().is_some()
    }

    /// Restore the backed up state and discard the backup
    pub fn recover(&self) -> Result<(), BackupIsNil> {
        let backup = self.backup.lock().take().ok_or(BackupIsNil)?;
        self.swap(backup);
        Ok(())
    }
}
