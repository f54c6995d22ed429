//! Output module for run reports and database statistics
//!
//! This module handles:
//! - The per-run report returned by the coordinator
//! - Loading and printing statistics for `--stats`

mod report;
pub mod stats;

pub use report::RunReport;
pub use stats::{load_statistics, print_statistics, HarvestStatistics};
