//! Per-run outcome returned by the coordinator

use crate::crawler::MergeResult;
use crate::storage::RunStatus;
use std::fmt;
use std::time::Duration;

/// Counts and final position of one harvest run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Row id in the `runs` table
    pub run_id: Option<i64>,

    pub status: RunStatus,

    /// Entities merged (inserted + updated + unchanged)
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,

    /// Entities not found upstream or rejected by the API
    pub skipped: u64,

    /// Entities whose fetch kept failing after every retry
    pub failed: u64,

    /// Search hits owned by another worker's partition
    pub foreign: u64,

    /// Pages merged and checkpointed
    pub pages: u64,

    /// Pages whose fetch failed or was rejected
    pub failed_pages: u64,

    /// Batches aborted by a merge or checkpoint failure
    pub batch_failures: u64,

    /// Times the run waited for a quota reset
    pub quota_waits: u64,

    /// Checkpoint persisted when the run ended
    pub final_checkpoint: Option<String>,

    pub elapsed: Duration,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Running,
            processed: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
            foreign: 0,
            pages: 0,
            failed_pages: 0,
            batch_failures: 0,
            quota_waits: 0,
            final_checkpoint: None,
            elapsed: Duration::ZERO,
        }
    }
}

impl RunReport {
    /// Adds the counts of one committed merge
    pub fn record_merge(&mut self, result: &MergeResult) {
        self.inserted += result.inserted as u64;
        self.updated += result.updated as u64;
        self.unchanged += result.unchanged as u64;
        self.processed += result.total() as u64;
        self.pages += 1;
    }

    /// Entities merged per second of wall time
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Harvest Run ===")?;
        if let Some(run_id) = self.run_id {
            writeln!(f, "  Run: {} ({})", run_id, self.status.to_db_string())?;
        }
        writeln!(
            f,
            "  Processed: {} ({} inserted, {} updated, {} unchanged)",
            self.processed, self.inserted, self.updated, self.unchanged
        )?;
        writeln!(f, "  Skipped: {}", self.skipped)?;
        writeln!(f, "  Failed: {}", self.failed)?;
        if self.foreign > 0 {
            writeln!(f, "  Left to other partitions: {}", self.foreign)?;
        }
        writeln!(
            f,
            "  Pages: {} merged, {} failed",
            self.pages, self.failed_pages
        )?;
        if self.batch_failures > 0 {
            writeln!(f, "  Batch failures: {}", self.batch_failures)?;
        }
        if self.quota_waits > 0 {
            writeln!(f, "  Quota waits: {}", self.quota_waits)?;
        }
        writeln!(
            f,
            "  Final checkpoint: {}",
            self.final_checkpoint.as_deref().unwrap_or("<none>")
        )?;
        write!(
            f,
            "  Elapsed: {:.1}s ({:.1} repos/sec)",
            self.elapsed.as_secs_f64(),
            self.rate()
        )
    }
}
