//! Crawler module for repository harvesting
//!
//! This module contains the core harvesting logic, including:
//! - GraphQL request and response handling
//! - Fetching with retry and quota accounting
//! - Staleness scheduling for refresh crawls
//! - Merging fetched repositories into storage
//! - Overall crawl coordination

mod coordinator;
mod fetcher;
mod merge;
mod query;
mod scheduler;

pub use coordinator::{Coordinator, REFRESH_LAST_ID, SEARCH_CURSOR};
pub use fetcher::{
    build_http_client, classify_reqwest_error, classify_status, Backoff, BackoffPolicy,
    FetchError, FetchExecutor, FetchedPage, RetryDisposition,
};
pub use merge::{MergeEngine, MergePlan, MergeResult};
pub use query::{PageRequest, NODES_QUERY, SEARCH_QUERY};
pub use scheduler::{RepoRef, StalenessScheduler, Tier, TierTable};
