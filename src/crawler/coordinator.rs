//! Crawl coordinator - main harvest orchestration logic
//!
//! This module contains the main crawl loop that composes the other
//! components, including:
//! - Recording each run in the `runs` table
//! - Acquiring credentials and waiting out exhausted quota
//! - Fetching pages and merging them into storage
//! - Advancing checkpoints only after a merge has committed
//! - Honouring cancellation between iterations
//!
//! Per iteration the coordinator walks
//! `Idle -> AcquiringCredential -> Fetching -> Merging -> CheckpointAdvanced -> Idle`.

use crate::config::{Config, CrawlStrategy, RunMode};
use crate::crawler::fetcher::{FetchError, FetchExecutor, FetchedPage};
use crate::crawler::merge::{MergeEngine, MergeResult};
use crate::crawler::query::PageRequest;
use crate::crawler::scheduler::{RepoRef, StalenessScheduler, TierTable};
use crate::output::RunReport;
use crate::quota::{Credential, QuotaTracker};
use crate::state::CrawlPhase;
use crate::storage::{
    checkpoint_key, CheckpointStore, Partition, Repository, RunStatus, SharedStorage,
    SqliteStorage, Storage, StorageError,
};
use crate::{HarvestError, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Checkpoint name for the discover strategy's search cursor
pub const SEARCH_CURSOR: &str = "search_cursor";

/// Checkpoint name for the refresh strategy's progress marker
pub const REFRESH_LAST_ID: &str = "refresh_last_id";

/// Pages between progress log lines
const PROGRESS_EVERY: u64 = 10;

/// How a single pass over the candidate set ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    Drained,
    LimitReached,
    Cancelled,
}

/// What to persist once a merge has committed
enum CheckpointAdvance {
    Save(String),
    Clear,
}

/// Outcome of one fetch-merge-checkpoint iteration
enum Step {
    Merged,
    Skipped,
    BatchFailed,
    Cancelled,
}

/// Main harvest coordinator
pub struct Coordinator {
    config: Arc<Config>,
    config_hash: String,
    storage: SharedStorage,
    checkpoints: Arc<dyn CheckpointStore>,
    quota: QuotaTracker,
    executor: FetchExecutor,
    scheduler: StalenessScheduler,
    phase: CrawlPhase,
    report: RunReport,
    consecutive_batch_failures: u32,
    started: Instant,
}

impl Coordinator {
    /// Creates a coordinator over injected collaborators
    ///
    /// # Arguments
    ///
    /// * `config` - The harvester configuration
    /// * `storage` - Canonical store shared with the merge engine
    /// * `checkpoints` - Where crawl cursors are persisted
    /// * `quota` - Shared credential budget tracker
    /// * `executor` - Fetch executor billing the same tracker
    pub fn new(
        config: Config,
        storage: SharedStorage,
        checkpoints: Arc<dyn CheckpointStore>,
        quota: QuotaTracker,
        executor: FetchExecutor,
    ) -> Self {
        let scheduler = StalenessScheduler::new(TierTable::from_config(&config.tiers));
        Self {
            config: Arc::new(config),
            config_hash: String::new(),
            storage,
            checkpoints,
            quota,
            executor,
            scheduler,
            phase: CrawlPhase::Idle,
            report: RunReport::default(),
            consecutive_batch_failures: 0,
            started: Instant::now(),
        }
    }

    /// Builds production collaborators from the configuration
    ///
    /// The SQLite database doubles as the checkpoint store.
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Successfully created coordinator
    /// * `Err(HarvestError)` - Failed to open storage or resolve credentials
    pub fn from_config(config: Config, config_hash: impl Into<String>) -> Result<Self> {
        let storage = SqliteStorage::new(Path::new(&config.output.database_path))?;
        let storage: SharedStorage = Arc::new(Mutex::new(storage));
        let checkpoints: Arc<dyn CheckpointStore> = storage.clone();
        let quota = QuotaTracker::from_config(&config)?;
        let executor = FetchExecutor::from_config(&config, quota.clone())?;

        Ok(Self::new(config, storage, checkpoints, quota, executor).with_config_hash(config_hash))
    }

    /// Sets the hash recorded on run rows
    pub fn with_config_hash(mut self, config_hash: impl Into<String>) -> Self {
        self.config_hash = config_hash.into();
        self
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    pub fn storage(&self) -> SharedStorage {
        self.storage.clone()
    }

    fn worker_key(&self, name: &str) -> String {
        checkpoint_key(&self.config.worker.id, name)
    }

    fn partition(&self) -> Partition {
        Partition {
            index: self.config.worker.partition_index,
            count: self.config.worker.partition_count,
        }
    }

    fn lock_storage(&self) -> Result<MutexGuard<'_, SqliteStorage>> {
        self.storage
            .lock()
            .map_err(|e| HarvestError::Storage(StorageError::Poisoned(e.to_string())))
    }

    fn transition(&mut self, next: CrawlPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(HarvestError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::trace!("Phase {} -> {}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Clears this worker's checkpoints so the next run starts from scratch
    pub fn reset_checkpoints(&self) -> Result<()> {
        for name in [SEARCH_CURSOR, REFRESH_LAST_ID] {
            let key = self.worker_key(name);
            self.checkpoints
                .clear(&key)
                .map_err(|source| HarvestError::CheckpointWriteFailed { key, source })?;
        }
        tracing::info!("Cleared checkpoints for worker {}", self.config.worker.id);
        Ok(())
    }

    /// Runs the harvest until drained, limited or cancelled
    ///
    /// In continuous mode drained passes are followed by an idle wait and a
    /// fresh pass. Cancellation is observed between iterations and during
    /// waits, never while a merge is in progress.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The run completed or was interrupted cleanly
    /// * `Err(HarvestError)` - The run failed; storage matches its last checkpoint
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunReport> {
        self.started = Instant::now();
        self.report = RunReport::default();
        self.consecutive_batch_failures = 0;

        let strategy = match self.config.crawler.strategy {
            CrawlStrategy::Discover => "discover",
            CrawlStrategy::Refresh => "refresh",
        };
        let run_id = self.lock_storage()?.create_run(
            &self.config.worker.id,
            strategy,
            &self.config_hash,
        )?;
        self.report.run_id = Some(run_id);
        tracing::info!(
            "Starting {} run {} as worker {} (partition {}/{})",
            strategy,
            run_id,
            self.config.worker.id,
            self.config.worker.partition_index,
            self.config.worker.partition_count
        );

        let outcome = self.run_passes(&cancel).await;

        let status = match &outcome {
            Ok(PassEnd::Cancelled) => RunStatus::Interrupted,
            Ok(_) => RunStatus::Completed,
            Err(_) => RunStatus::Failed,
        };
        self.report.status = status;
        self.report.elapsed = self.started.elapsed();

        let finished = self.lock_storage().and_then(|mut storage| {
            storage
                .finish_run(
                    run_id,
                    status,
                    self.report.processed,
                    self.report.skipped,
                    self.report.failed,
                    self.report.final_checkpoint.as_deref(),
                )
                .map_err(HarvestError::from)
        });

        match outcome {
            Ok(end) => {
                finished?;
                tracing::info!(
                    "Run {} {:?}: {} processed, {} skipped, {} failed in {:.1}s",
                    run_id,
                    end,
                    self.report.processed,
                    self.report.skipped,
                    self.report.failed,
                    self.report.elapsed.as_secs_f64()
                );
                Ok(self.report.clone())
            }
            Err(e) => {
                if let Err(finish_err) = finished {
                    tracing::error!("Failed to record end of run {}: {}", run_id, finish_err);
                }
                tracing::error!("Run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    async fn run_passes(&mut self, cancel: &CancellationToken) -> Result<PassEnd> {
        loop {
            if self.phase.is_terminal() {
                self.transition(CrawlPhase::Idle)?;
            }

            let end = match self.config.crawler.strategy {
                CrawlStrategy::Discover => self.discover_pass(cancel).await?,
                CrawlStrategy::Refresh => self.refresh_pass(cancel).await?,
            };

            if end != PassEnd::Drained || self.config.crawler.mode == RunMode::Once {
                return Ok(end);
            }

            let idle = Duration::from_secs(self.config.crawler.idle_interval_secs);
            tracing::info!("Pass complete, idling for {:?}", idle);
            if !wait_or_cancel(cancel, idle).await {
                return Ok(PassEnd::Cancelled);
            }
        }
    }

    fn limit_reached(&self) -> bool {
        let max = self.config.crawler.max_entities;
        max > 0 && self.report.processed >= max
    }

    /// Page size for the next request, shrunk to the remaining entity allowance
    fn next_page_size(&self) -> u32 {
        let page_size = self.config.crawler.page_size;
        let max = self.config.crawler.max_entities;
        if max == 0 {
            return page_size;
        }
        let remaining = max.saturating_sub(self.report.processed);
        page_size.min(remaining.min(u32::MAX as u64) as u32).max(1)
    }

    /// Checks the loop guards at the top of an iteration
    fn should_stop(&mut self, cancel: &CancellationToken) -> Result<Option<PassEnd>> {
        let end = if cancel.is_cancelled() {
            tracing::info!("Cancellation requested, draining");
            PassEnd::Cancelled
        } else if self.limit_reached() {
            tracing::info!("Reached limit of {} entities", self.config.crawler.max_entities);
            PassEnd::LimitReached
        } else {
            return Ok(None);
        };
        self.transition(CrawlPhase::Draining)?;
        Ok(Some(end))
    }

    async fn discover_pass(&mut self, cancel: &CancellationToken) -> Result<PassEnd> {
        let key = self.worker_key(SEARCH_CURSOR);
        let mut cursor = self.load_cursor(&key)?;
        match &cursor {
            Some(value) => tracing::info!("Resuming search from checkpoint {}", value),
            None => tracing::info!("Starting search from the first page"),
        }
        self.report.final_checkpoint = cursor.clone();

        loop {
            if let Some(end) = self.should_stop(cancel)? {
                return Ok(end);
            }

            let request = PageRequest::Search {
                query: self.config.api.search_query.clone(),
                first: self.next_page_size(),
                after: cursor.clone(),
            };

            let mut next_cursor = None;
            let step = self
                .fetch_merge_checkpoint(cancel, &request, &key, |page| {
                    next_cursor = page.next_cursor.clone();
                    match &page.next_cursor {
                        Some(next) => CheckpointAdvance::Save(next.clone()),
                        None => CheckpointAdvance::Clear,
                    }
                })
                .await?;

            match step {
                Step::Merged => {
                    if next_cursor.is_none() {
                        tracing::info!("Search results exhausted");
                        self.transition(CrawlPhase::Draining)?;
                        return Ok(PassEnd::Drained);
                    }
                    cursor = next_cursor;
                }
                Step::Skipped => {
                    // The cursor cannot move past a page that was never merged
                    tracing::warn!("Ending search pass at cursor {:?}", cursor);
                    self.transition(CrawlPhase::Draining)?;
                    return Ok(PassEnd::Drained);
                }
                Step::BatchFailed => {
                    cursor = self.load_cursor(&key)?;
                    self.report.final_checkpoint = cursor.clone();
                    self.batch_failure_pause(cancel).await;
                }
                Step::Cancelled => return Ok(PassEnd::Cancelled),
            }
        }
    }

    async fn refresh_pass(&mut self, cancel: &CancellationToken) -> Result<PassEnd> {
        let key = self.worker_key(REFRESH_LAST_ID);
        let previous = self.load_cursor(&key)?;
        if let Some(last_id) = &previous {
            tracing::debug!("Previous refresh stopped after repository {}", last_id);
        }
        self.report.final_checkpoint = previous;

        let page_size = self.config.crawler.page_size.max(1) as usize;
        let batch_size = self.config.crawler.batch_size.max(1) as usize;
        let mut attempted: HashSet<i64> = HashSet::new();

        loop {
            if let Some(end) = self.should_stop(cancel)? {
                return Ok(end);
            }

            let batch: Vec<RepoRef> = {
                let storage = self.lock_storage()?;
                self.scheduler.next_batch_from(
                    &*storage,
                    self.partition(),
                    batch_size + attempted.len(),
                    Utc::now(),
                )?
            }
            .into_iter()
            .filter(|r| !attempted.contains(&r.repo_id))
            .take(batch_size)
            .collect();

            if batch.is_empty() {
                tracing::info!("No repositories due for refresh");
                self.transition(CrawlPhase::Draining)?;
                return Ok(PassEnd::Drained);
            }
            tracing::info!("Refreshing batch of {} due repositories", batch.len());

            let mut sub_pages = batch.chunks(page_size);
            let mut pending = sub_pages.next();
            while let Some(sub_page) = pending {
                if let Some(end) = self.should_stop(cancel)? {
                    return Ok(end);
                }

                let request = PageRequest::Nodes {
                    ids: sub_page.iter().map(|r| r.node_id.clone()).collect(),
                };
                let last_id = sub_page
                    .last()
                    .map(|r| r.repo_id.to_string())
                    .unwrap_or_default();

                let step = self
                    .fetch_merge_checkpoint(cancel, &request, &key, |_| {
                        CheckpointAdvance::Save(last_id.clone())
                    })
                    .await?;

                match step {
                    Step::Merged | Step::Skipped => {
                        attempted.extend(sub_page.iter().map(|r| r.repo_id));
                        pending = sub_pages.next();
                    }
                    Step::BatchFailed => {
                        self.report.final_checkpoint = self.load_cursor(&key)?;
                        self.batch_failure_pause(cancel).await;
                    }
                    Step::Cancelled => return Ok(PassEnd::Cancelled),
                }
            }
        }
    }

    /// Acquires, fetches, merges and advances the checkpoint for one request
    ///
    /// `advance` picks the checkpoint write from the fetched page. The write
    /// is applied only after the merge has committed.
    async fn fetch_merge_checkpoint<F>(
        &mut self,
        cancel: &CancellationToken,
        request: &PageRequest,
        key: &str,
        advance: F,
    ) -> Result<Step>
    where
        F: FnOnce(&FetchedPage) -> CheckpointAdvance,
    {
        let mut page = loop {
            let Some(credential) = self.acquire_credential(cancel).await? else {
                return Ok(Step::Cancelled);
            };

            self.transition(CrawlPhase::Fetching)?;
            match self.executor.fetch_page(&credential, request).await {
                Ok(page) => break page,
                // The tracker has withdrawn the credential; the next acquire picks another
                Err(FetchError::Unauthorized { cause }) => {
                    tracing::warn!("Credential {} refused ({}), retrying request", credential.id, cause);
                    self.transition(CrawlPhase::Idle)?;
                }
                Err(e) => {
                    self.record_fetch_failure(request, e.into());
                    self.transition(CrawlPhase::Idle)?;
                    return Ok(Step::Skipped);
                }
            }
        };

        for node_id in &page.missing {
            tracing::warn!("Repository {} not found upstream, skipping", node_id);
        }
        self.report.skipped += page.missing.len() as u64 + page.unidentified as u64;

        let partition = self.partition();
        let before = page.items.len();
        page.items.retain(|repo| partition.contains(repo.repo_id));
        let foreign = before - page.items.len();
        if foreign > 0 {
            tracing::debug!(
                "Left {} repositories to other partitions than {}/{}",
                foreign,
                partition.index,
                partition.count
            );
            self.report.foreign += foreign as u64;
        }

        self.transition(CrawlPhase::Merging)?;
        let checkpoint = advance(&page);
        match self.merge_then_checkpoint(&page.items, key, checkpoint) {
            Ok(result) => {
                self.consecutive_batch_failures = 0;
                self.report.record_merge(&result);
                self.transition(CrawlPhase::CheckpointAdvanced)?;
                self.log_progress();
                self.transition(CrawlPhase::Idle)?;
                Ok(Step::Merged)
            }
            Err(e) if e.is_batch_failure() => {
                self.transition(CrawlPhase::Idle)?;
                self.consecutive_batch_failures += 1;
                self.report.batch_failures += 1;
                tracing::error!(
                    "Batch failed ({} in a row): {}",
                    self.consecutive_batch_failures,
                    e
                );
                if self.consecutive_batch_failures
                    >= self.config.crawler.max_consecutive_batch_failures
                {
                    return Err(e);
                }
                Ok(Step::BatchFailed)
            }
            Err(e) => Err(e),
        }
    }

    /// Commits the merge, then persists the checkpoint that covers it
    fn merge_then_checkpoint(
        &mut self,
        items: &[Repository],
        key: &str,
        checkpoint: CheckpointAdvance,
    ) -> Result<MergeResult> {
        let result = {
            let mut storage = self
                .storage
                .lock()
                .map_err(|e| HarvestError::MergeFailed(StorageError::Poisoned(e.to_string())))?;
            MergeEngine::merge(&mut *storage, items, Utc::now())?
        };

        let written = match &checkpoint {
            CheckpointAdvance::Save(value) => self.checkpoints.save(key, value),
            CheckpointAdvance::Clear => self.checkpoints.clear(key),
        };
        written.map_err(|source| HarvestError::CheckpointWriteFailed {
            key: key.to_string(),
            source,
        })?;

        self.report.final_checkpoint = match checkpoint {
            CheckpointAdvance::Save(value) => Some(value),
            CheckpointAdvance::Clear => None,
        };
        Ok(result)
    }

    fn record_fetch_failure(&mut self, request: &PageRequest, err: HarvestError) {
        self.report.failed_pages += 1;
        let entities = match request {
            PageRequest::Nodes { ids } => ids.len() as u64,
            PageRequest::Search { .. } => 0,
        };
        match err {
            HarvestError::FetchRejected { .. } => {
                self.report.skipped += entities;
                tracing::warn!("Skipping {} repositories: {}", entities, err);
            }
            _ => {
                self.report.failed += entities;
                tracing::warn!("Giving up on {} repositories: {}", entities, err);
            }
        }
    }

    /// Acquires a credential, waiting for quota resets as needed
    ///
    /// Returns None, with the phase at `Draining`, if cancelled while waiting.
    async fn acquire_credential(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<Credential>> {
        self.transition(CrawlPhase::AcquiringCredential)?;
        let timeout = Duration::from_secs(self.config.quota.acquire_timeout_secs);

        loop {
            match self.quota.acquire(timeout).await {
                Ok(credential) => return Ok(Some(credential)),
                Err(HarvestError::QuotaExhausted { next_reset }) => {
                    self.transition(CrawlPhase::WaitingForQuota)?;
                    self.report.quota_waits += 1;

                    let wait = next_reset
                        .map(|reset| (reset - Utc::now()).to_std().unwrap_or_default())
                        .unwrap_or_else(|| {
                            Duration::from_secs(self.config.crawler.idle_interval_secs)
                        });
                    tracing::info!(
                        "All credentials at or below margin, waiting {:?} for reset at {:?}",
                        wait,
                        next_reset
                    );

                    if !wait_or_cancel(cancel, wait).await {
                        self.transition(CrawlPhase::Draining)?;
                        return Ok(None);
                    }
                    self.transition(CrawlPhase::AcquiringCredential)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleeps before retrying a failed batch
    async fn batch_failure_pause(&self, cancel: &CancellationToken) {
        let attempt = self.consecutive_batch_failures.saturating_sub(1);
        let delay = self.executor.policy().delay_for_attempt(attempt);
        wait_or_cancel(cancel, delay).await;
    }

    fn log_progress(&mut self) {
        if self.report.pages % PROGRESS_EVERY != 0 {
            return;
        }
        self.report.elapsed = self.started.elapsed();
        tracing::info!(
            "Progress: {} processed ({:.1}/s), {} skipped, {} pages, {} quota remaining",
            self.report.processed,
            self.report.rate(),
            self.report.skipped,
            self.report.pages,
            self.quota.total_remaining()
        );
    }

    fn load_cursor(&self, key: &str) -> Result<Option<String>> {
        Ok(self.checkpoints.load(key)?.map(|c| c.value))
    }
}

/// Sleeps for `wait` unless cancelled first; returns false on cancellation
async fn wait_or_cancel(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}
