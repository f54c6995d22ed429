//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::storage::{
    Checkpoint, CrawlCandidate, MergeWrites, Partition, RepositoryRecord, RunRecord, RunStatus,
    SnapshotRecord,
};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Storage lock poisoned: {0}")]
    Poisoned(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// The merge engine is the only caller of `apply_merge`; everything else in
/// the crate reads.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new harvest run in the `running` state
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, worker_id: &str, strategy: &str, config_hash: &str)
        -> StorageResult<i64>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// Gets the most recent runs, newest first
    fn get_recent_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>>;

    /// Records the outcome of a run and its finish timestamp
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        processed: u64,
        skipped: u64,
        failed: u64,
        final_checkpoint: Option<&str>,
    ) -> StorageResult<()>;

    // ===== Repositories =====

    /// Gets a repository row by remote id
    fn get_repository(&self, repo_id: i64) -> StorageResult<Option<RepositoryRecord>>;

    /// Gets the repository rows for the given ids; absent ids are omitted
    fn get_repositories(&self, repo_ids: &[i64]) -> StorageResult<HashMap<i64, RepositoryRecord>>;

    /// Lists the scheduling columns of every repository in a partition
    fn crawl_candidates(&self, partition: Partition) -> StorageResult<Vec<CrawlCandidate>>;

    /// Applies every write of one merge atomically
    ///
    /// Either all rows are committed or none are.
    fn apply_merge(&mut self, writes: &MergeWrites) -> StorageResult<()>;

    /// Counts repository rows
    fn count_repositories(&self) -> StorageResult<u64>;

    // ===== History =====

    /// Gets every snapshot for a repository, oldest first
    fn get_history(&self, repo_id: i64) -> StorageResult<Vec<SnapshotRecord>>;

    /// Counts all snapshot rows
    fn count_snapshots(&self) -> StorageResult<u64>;

    /// Counts distinct snapshot days
    fn count_snapshot_days(&self) -> StorageResult<u64>;

    // ===== Checkpoints =====

    /// Returns the last durably written value for `key`
    fn load_checkpoint(&self, key: &str) -> StorageResult<Option<Checkpoint>>;

    /// Atomically replaces the value for `key`
    fn save_checkpoint(&mut self, key: &str, value: &str) -> StorageResult<()>;

    /// Deletes `key`; a missing key is not an error
    fn clear_checkpoint(&mut self, key: &str) -> StorageResult<()>;

    /// Lists all checkpoints, optionally restricted to a key prefix
    fn list_checkpoints(&self, prefix: Option<&str>) -> StorageResult<Vec<Checkpoint>>;
}
