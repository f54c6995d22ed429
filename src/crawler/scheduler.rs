//! Staleness scheduler for refresh crawls
//!
//! This module handles:
//! - The ordered tier table mapping update age to a refresh interval
//! - Deciding which stored repositories are due for a re-fetch
//! - Ordering due repositories by tier, popularity and identity
//!
//! The scheduler reads candidates and returns decisions; it never writes.

use crate::config::TierEntry;
use crate::storage::{CrawlCandidate, Partition, Storage, StorageResult};
use chrono::{DateTime, Duration, Utc};
use std::cmp::{Ordering, Reverse};

/// A staleness class and how often its members are re-fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub name: String,

    /// Largest age since remote update that still falls in this tier;
    /// None marks the catch-all tier
    pub max_update_age: Option<Duration>,

    /// Crawl age after which a member is due
    pub refresh_interval: Duration,
}

/// Tiers in ascending boundary order, ending with a catch-all
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Builds the table from `[[tiers]]` entries
    ///
    /// Entries are expected to be validated already; a table without a
    /// catch-all gets one appended from its last tier's interval.
    pub fn from_config(entries: &[TierEntry]) -> Self {
        let mut tiers: Vec<Tier> = entries
            .iter()
            .map(|entry| Tier {
                name: entry.name.clone(),
                max_update_age: entry
                    .max_update_age_days
                    .map(|days| Duration::days(days as i64)),
                refresh_interval: Duration::hours(entry.refresh_interval_hours as i64),
            })
            .collect();

        if tiers.last().map_or(true, |t| t.max_update_age.is_some()) {
            let refresh_interval = tiers
                .last()
                .map(|t| t.refresh_interval)
                .unwrap_or_else(|| Duration::days(90));
            tiers.push(Tier {
                name: "catch-all".to_string(),
                max_update_age: None,
                refresh_interval,
            });
        }

        Self { tiers }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Returns the index of the tier for a given age since remote update
    pub fn index_for_age(&self, age: Option<Duration>) -> usize {
        let catch_all = self.tiers.len().saturating_sub(1);
        let Some(age) = age else {
            return catch_all;
        };
        self.tiers
            .iter()
            .position(|tier| tier.max_update_age.map_or(true, |max| age <= max))
            .unwrap_or(catch_all)
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::from_config(&crate::config::default_tiers())
    }
}

/// A repository selected for re-fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub repo_id: i64,
    pub node_id: String,
}

struct Ranked<'a> {
    tier: usize,
    candidate: &'a CrawlCandidate,
}

impl Ranked<'_> {
    fn priority_cmp(&self, other: &Self) -> Ordering {
        (self.tier, Reverse(self.candidate.stars), self.candidate.repo_id).cmp(&(
            other.tier,
            Reverse(other.candidate.stars),
            other.candidate.repo_id,
        ))
    }
}

/// Decides which repositories are due and in what order
pub struct StalenessScheduler {
    tiers: TierTable,
}

impl StalenessScheduler {
    pub fn new(tiers: TierTable) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Classifies a candidate by age since its remote update
    ///
    /// Candidates without a remote update time land in the catch-all tier.
    pub fn classify(&self, candidate: &CrawlCandidate, now: DateTime<Utc>) -> (usize, &Tier) {
        let age = candidate.remote_updated_at.map(|ts| now - ts);
        let index = self.tiers.index_for_age(age);
        (index, &self.tiers.tiers[index])
    }

    /// Checks if a candidate is due for re-fetch
    ///
    /// Never-crawled candidates are always due; otherwise the crawl age must
    /// exceed the tier's refresh interval.
    pub fn is_due(&self, candidate: &CrawlCandidate, now: DateTime<Utc>) -> bool {
        let (_, tier) = self.classify(candidate, now);
        match candidate.last_crawled_at {
            None => true,
            Some(crawled) => now - crawled > tier.refresh_interval,
        }
    }

    /// Selects at most `limit` due candidates in priority order
    ///
    /// Order is tier ascending, then stars descending, then id ascending.
    /// Returns fewer than `limit` when fewer are due.
    pub fn next_batch(
        &self,
        candidates: &[CrawlCandidate],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<RepoRef> {
        let mut due: Vec<Ranked<'_>> = candidates
            .iter()
            .filter(|c| self.is_due(c, now))
            .map(|candidate| Ranked {
                tier: self.classify(candidate, now).0,
                candidate,
            })
            .collect();

        due.sort_by(|a, b| a.priority_cmp(b));

        due.into_iter()
            .take(limit)
            .map(|r| RepoRef {
                repo_id: r.candidate.repo_id,
                node_id: r.candidate.node_id.clone(),
            })
            .collect()
    }

    /// Reads candidates for a partition from storage and selects a batch
    pub fn next_batch_from<S: Storage + ?Sized>(
        &self,
        storage: &S,
        partition: Partition,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<RepoRef>> {
        let candidates = storage.crawl_candidates(partition)?;
        let batch = self.next_batch(&candidates, limit, now);
        tracing::debug!(
            "Scheduler selected {} of {} candidates",
            batch.len(),
            candidates.len()
        );
        Ok(batch)
    }
}
