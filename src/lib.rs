//! Star-Harvest: an incremental repository metadata harvester
//!
//! This crate pulls repository facts (stars, description, language, update
//! timestamps) from a paginated, quota-metered GraphQL API and stores them with
//! daily history snapshots, resuming from durable checkpoints after restarts.

pub mod config;
pub mod crawler;
pub mod output;
pub mod quota;
pub mod state;
pub mod storage;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for Star-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every credential is at or below the safety margin
    #[error("Quota exhausted on all credentials (next reset: {next_reset:?})")]
    QuotaExhausted { next_reset: Option<DateTime<Utc>> },

    #[error("Every credential was refused by the API")]
    CredentialsRevoked,

    /// Transient failure that survived every retry
    #[error("Fetch failed after {attempts} attempts: {cause}")]
    FetchFailed { attempts: u32, cause: String },

    /// Permanent failure, never retried
    #[error("Fetch rejected: {cause}")]
    FetchRejected { cause: String },

    #[error("Checkpoint write failed for {key}: {source}")]
    CheckpointWriteFailed {
        key: String,
        source: storage::StorageError,
    },

    #[error("Merge failed: {0}")]
    MergeFailed(storage::StorageError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::CrawlPhase,
        to: state::CrawlPhase,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Returns true for errors that abort only the current batch
    pub fn is_batch_failure(&self) -> bool {
        matches!(
            self,
            Self::MergeFailed(_) | Self::CheckpointWriteFailed { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Missing credential token: {0}")]
    MissingToken(String),
}

/// Result type alias for Star-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::Coordinator;
pub use output::RunReport;
pub use quota::{Credential, QuotaTracker};
pub use state::{CrawlPhase, CredentialState};
