//! Statistics generation from the harvest database
//!
//! This module provides functionality for extracting and displaying
//! harvest statistics from the storage layer.

use crate::storage::{Checkpoint, RunRecord, Storage};
use crate::Result;

/// Number of recent runs included in the statistics
const RECENT_RUNS: u32 = 5;

/// Harvest statistics summary
#[derive(Debug, Clone)]
pub struct HarvestStatistics {
    /// Total number of canonical repository rows
    pub total_repositories: u64,

    /// Total number of history snapshots
    pub total_snapshots: u64,

    /// Number of distinct snapshot days
    pub snapshot_days: u64,

    /// Every stored checkpoint, ordered by key
    pub checkpoints: Vec<Checkpoint>,

    /// Most recent runs, newest first
    pub recent_runs: Vec<RunRecord>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
///
/// # Returns
///
/// * `Ok(HarvestStatistics)` - Successfully loaded statistics
/// * `Err(HarvestError)` - Failed to query statistics
pub fn load_statistics(storage: &dyn Storage) -> Result<HarvestStatistics> {
    Ok(HarvestStatistics {
        total_repositories: storage.count_repositories()?,
        total_snapshots: storage.count_snapshots()?,
        snapshot_days: storage.count_snapshot_days()?,
        checkpoints: storage.list_checkpoints(None)?,
        recent_runs: storage.get_recent_runs(RECENT_RUNS)?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &HarvestStatistics) {
    println!("=== Harvest Statistics ===\n");

    println!("Overview:");
    println!("  Repositories: {}", stats.total_repositories);
    println!("  Snapshots: {}", stats.total_snapshots);
    println!("  Snapshot days: {}", stats.snapshot_days);
    if stats.snapshot_days > 0 {
        println!(
            "  Average snapshots per day: {:.1}",
            stats.total_snapshots as f64 / stats.snapshot_days as f64
        );
    }
    println!();

    if !stats.checkpoints.is_empty() {
        println!("Checkpoints ({}):", stats.checkpoints.len());
        for checkpoint in &stats.checkpoints {
            println!(
                "  {} = {} (updated {})",
                checkpoint.key,
                checkpoint.value,
                checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        println!();
    }

    if !stats.recent_runs.is_empty() {
        println!("Recent Runs:");
        for run in &stats.recent_runs {
            println!(
                "  #{} {} {} [{}] started {} processed {} skipped {} failed {}",
                run.id,
                run.worker_id,
                run.strategy,
                run.status.to_db_string(),
                run.started_at,
                run.processed,
                run.skipped,
                run.failed
            );
        }
    }
}
