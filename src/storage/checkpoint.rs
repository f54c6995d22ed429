//! Checkpoint store: durable named cursors
//!
//! A checkpoint value may only be saved after every entity it covers has been
//! merged. `save` either commits or returns an error, and callers must not
//! advance their in-memory cursor unless it returned `Ok`.

use crate::storage::{Checkpoint, Storage, StorageError, StorageResult};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Durable key/value record of crawl progress
///
/// Methods take `&self` so a single store can be shared behind an `Arc`
/// between the orchestrator and tests that inspect it.
pub trait CheckpointStore: Send + Sync {
    /// Returns the last durably written checkpoint, or None if never set
    fn load(&self, key: &str) -> StorageResult<Option<Checkpoint>>;

    /// Durably replaces the value for `key` (last write wins)
    fn save(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key` so the next load returns None
    fn clear(&self, key: &str) -> StorageResult<()>;
}

/// Builds the per-worker key for a named checkpoint
///
/// Workers never share keys, so concurrent workers never write the same row.
pub fn checkpoint_key(worker_id: &str, name: &str) -> String {
    format!("{}/{}", worker_id, name)
}

fn lock_storage<S>(storage: &Mutex<S>) -> StorageResult<MutexGuard<'_, S>> {
    storage
        .lock()
        .map_err(|e| StorageError::Poisoned(e.to_string()))
}

impl<S: Storage + Send> CheckpointStore for Mutex<S> {
    fn load(&self, key: &str) -> StorageResult<Option<Checkpoint>> {
        lock_storage(self)?.load_checkpoint(key)
    }

    fn save(&self, key: &str, value: &str) -> StorageResult<()> {
        lock_storage(self)?.save_checkpoint(key, value)
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        lock_storage(self)?.clear_checkpoint(key)
    }
}

/// In-process checkpoint store for isolated runs and tests
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &str) -> StorageResult<Option<Checkpoint>> {
        Ok(lock_storage(&self.entries)?.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> StorageResult<()> {
        lock_storage(&self.entries)?.insert(
            key.to_string(),
            Checkpoint {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        lock_storage(&self.entries)?.remove(key);
        Ok(())
    }
}
