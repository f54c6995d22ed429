//! Storage module for persisting harvest data
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Canonical repository rows and daily star history
//! - Named crawl checkpoints
//! - Run tracking

mod checkpoint;
mod schema;
mod sqlite;
mod traits;

pub use checkpoint::{checkpoint_key, CheckpointStore, MemoryCheckpointStore};
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use std::sync::{Arc, Mutex};

/// Shared handle to the SQLite store used by every component of one process
pub type SharedStorage = Arc<Mutex<SqliteStorage>>;

/// A repository as fetched from the remote API
///
/// `repo_id` and `node_id` form the immutable identity; everything else is
/// overwritten wholesale by each newer fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub repo_id: i64,
    pub node_id: String,
    pub owner: String,
    pub name: String,
    pub url: Option<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub stars: u32,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Returns true if any mutable attribute differs from `other`
    pub fn attributes_differ(&self, other: &Repository) -> bool {
        self.owner != other.owner
            || self.name != other.name
            || self.url != other.url
            || self.description != other.description
            || self.language != other.language
            || self.stars != other.stars
            || self.remote_updated_at != other.remote_updated_at
    }
}

/// A canonical repository row
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRecord {
    pub repository: Repository,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub updated_local_at: DateTime<Utc>,
}

/// The columns the staleness scheduler needs for one repository
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlCandidate {
    pub repo_id: i64,
    pub node_id: String,
    pub stars: u32,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub last_crawled_at: Option<DateTime<Utc>>,
}

/// A star count observed on one UTC day
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub repo_id: i64,
    pub snapshot_date: NaiveDate,
    pub stars: u32,
}

/// A named crawl cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Slice of identity space owned by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    /// The single partition covering every repository
    pub const ALL: Partition = Partition { index: 0, count: 1 };

    pub fn contains(&self, repo_id: i64) -> bool {
        repo_id.rem_euclid(self.count.max(1) as i64) == self.index as i64
    }
}

/// Every row write produced by one merge, applied in a single transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeWrites {
    /// Repositories with no canonical row yet
    pub inserts: Vec<Repository>,

    /// Repositories whose mutable attributes changed
    pub updates: Vec<Repository>,

    /// Repositories re-fetched without change; only the crawl time moves
    pub touches: Vec<i64>,

    /// History rows to upsert
    pub snapshots: Vec<SnapshotRecord>,

    /// Crawl time stamped on every row above
    pub crawled_at: DateTime<Utc>,
}

impl MergeWrites {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.touches.is_empty()
    }
}

/// Represents a harvest run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub worker_id: String,
    pub strategy: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub final_checkpoint: Option<String>,
}

/// Status of a harvest run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Formats a timestamp with fixed precision so text order is time order
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
