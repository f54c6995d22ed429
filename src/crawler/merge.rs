//! Merge/upsert engine
//!
//! Reconciles fetched repositories against canonical rows. Planning is pure;
//! the resulting writes are applied by storage in one transaction, so a batch
//! is either fully merged or not merged at all.

use crate::storage::{MergeWrites, Repository, RepositoryRecord, SnapshotRecord, Storage};
use crate::{HarvestError, Result};
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};

/// Counts produced by one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergeResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Writes to apply and the counts they represent
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub writes: MergeWrites,
    pub result: MergeResult,
}

pub struct MergeEngine;

impl MergeEngine {
    /// Decides the writes for a fetched batch
    ///
    /// New identities are inserted with a snapshot for today. Known
    /// identities whose attributes differ are replaced wholesale and today's
    /// snapshot is upserted. Unchanged identities only get their crawl time
    /// advanced. Repeated identities within the batch collapse to the last
    /// occurrence.
    pub fn plan(
        fetched: &[Repository],
        existing: &HashMap<i64, RepositoryRecord>,
        now: DateTime<Utc>,
    ) -> MergePlan {
        // Stored precision is microseconds
        let crawled_at = now.trunc_subsecs(6);
        let today = crawled_at.date_naive();

        let latest: BTreeMap<i64, &Repository> =
            fetched.iter().map(|repo| (repo.repo_id, repo)).collect();

        let mut writes = MergeWrites {
            crawled_at,
            ..Default::default()
        };
        let mut result = MergeResult::default();

        for (repo_id, repo) in latest {
            match existing.get(&repo_id) {
                None => {
                    writes.inserts.push(repo.clone());
                    result.inserted += 1;
                }
                Some(stored) => {
                    if stored.repository.node_id != repo.node_id {
                        tracing::warn!(
                            "Repository {} ({}) came back with node id {} (stored {}), keeping stored id",
                            repo_id,
                            repo.full_name(),
                            repo.node_id,
                            stored.repository.node_id
                        );
                    }
                    if repo.attributes_differ(&stored.repository) {
                        writes.updates.push(repo.clone());
                        result.updated += 1;
                    } else {
                        writes.touches.push(repo_id);
                        result.unchanged += 1;
                        continue;
                    }
                }
            }

            writes.snapshots.push(SnapshotRecord {
                repo_id,
                snapshot_date: today,
                stars: repo.stars,
            });
        }

        MergePlan { writes, result }
    }

    /// Merges a fetched batch into storage
    ///
    /// # Returns
    ///
    /// * `Ok(MergeResult)` - Every write committed
    /// * `Err(HarvestError::MergeFailed)` - Nothing committed
    pub fn merge<S: Storage + ?Sized>(
        storage: &mut S,
        fetched: &[Repository],
        now: DateTime<Utc>,
    ) -> Result<MergeResult> {
        if fetched.is_empty() {
            return Ok(MergeResult::default());
        }

        let ids: Vec<i64> = fetched.iter().map(|r| r.repo_id).collect();
        let existing = storage
            .get_repositories(&ids)
            .map_err(HarvestError::MergeFailed)?;

        let plan = Self::plan(fetched, &existing, now);
        storage
            .apply_merge(&plan.writes)
            .map_err(HarvestError::MergeFailed)?;

        tracing::debug!(
            "Merged {} repositories: {} inserted, {} updated, {} unchanged",
            plan.result.total(),
            plan.result.inserted,
            plan.result.updated,
            plan.result.unchanged
        );
        Ok(plan.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 9, 30, 0).unwrap()
    }

    fn create_test_repo(repo_id: i64, stars: u32) -> Repository {
        Repository {
            repo_id,
            node_id: format!("R_{}", repo_id),
            owner: "octo".to_string(),
            name: format!("repo-{}", repo_id),
            url: None,
            description: Some("desc".to_string()),
            language: Some("Rust".to_string()),
            stars,
            remote_updated_at: Some(now() - Duration::days(3)),
        }
    }

    fn create_test_storage() -> SqliteStorage {
        SqliteStorage::new_in_memory().unwrap()
    }

    #[test]
    fn test_new_repository_inserted_with_snapshot() {
        let mut storage = create_test_storage();
        let result = MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();
        assert_eq!(
            result,
            MergeResult {
                inserted: 1,
                updated: 0,
                unchanged: 0
            }
        );

        let history = storage.get_history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].snapshot_date, now().date_naive());
        assert_eq!(history[0].stars, 10);
    }

    #[test]
    fn test_unchanged_repository_only_advances_crawl_time() {
        let mut storage = create_test_storage();
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();

        let next_day = now() + Duration::days(1);
        let result = MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], next_day).unwrap();
        assert_eq!(result.unchanged, 1);

        let record = storage.get_repository(1).unwrap().unwrap();
        assert_eq!(record.last_crawled_at, Some(next_day));
        assert_eq!(record.updated_local_at, now());
        assert_eq!(storage.get_history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_changed_repository_replaced_and_snapshotted() {
        let mut storage = create_test_storage();
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();

        let mut changed = create_test_repo(1, 25);
        changed.description = None;
        let next_day = now() + Duration::days(1);
        let result = MergeEngine::merge(&mut storage, &[changed.clone()], next_day).unwrap();
        assert_eq!(result.updated, 1);

        let record = storage.get_repository(1).unwrap().unwrap();
        assert_eq!(record.repository, changed);
        assert_eq!(record.first_seen_at, now());

        let history = storage.get_history(1).unwrap();
        assert_eq!(
            history.iter().map(|h| h.stars).collect::<Vec<_>>(),
            vec![10, 25]
        );
    }

    #[test]
    fn test_same_day_merges_are_idempotent() {
        let mut storage = create_test_storage();
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();
        MergeEngine::merge(
            &mut storage,
            &[create_test_repo(1, 12)],
            now() + Duration::hours(2),
        )
        .unwrap();
        MergeEngine::merge(
            &mut storage,
            &[create_test_repo(1, 12)],
            now() + Duration::hours(3),
        )
        .unwrap();

        let history = storage.get_history(1).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].stars, 12);
    }

    #[test]
    fn test_crawl_time_is_monotonic() {
        let mut storage = create_test_storage();
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();

        // A worker with a lagging clock re-merges the same row
        let earlier = now() - Duration::hours(5);
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 11)], earlier).unwrap();

        let record = storage.get_repository(1).unwrap().unwrap();
        assert!(record.last_crawled_at.unwrap() >= now());
        assert_eq!(record.repository.stars, 11);
    }

    #[test]
    fn test_duplicates_collapse_to_last_occurrence() {
        let existing = HashMap::new();
        let plan = MergeEngine::plan(
            &[create_test_repo(1, 10), create_test_repo(2, 5), create_test_repo(1, 30)],
            &existing,
            now(),
        );
        assert_eq!(plan.result.inserted, 2);
        assert_eq!(plan.writes.inserts.len(), 2);
        let one = plan.writes.inserts.iter().find(|r| r.repo_id == 1).unwrap();
        assert_eq!(one.stars, 30);
        assert_eq!(plan.writes.snapshots.len(), 2);
    }

    #[test]
    fn test_plan_truncates_to_stored_precision() {
        let precise = now() + Duration::nanoseconds(1_234_567);
        let plan = MergeEngine::plan(&[create_test_repo(1, 1)], &HashMap::new(), precise);
        assert_eq!(plan.writes.crawled_at, now() + Duration::microseconds(1_234));
    }

    #[test]
    fn test_failed_merge_commits_nothing() {
        let mut storage = create_test_storage();
        MergeEngine::merge(&mut storage, &[create_test_repo(1, 10)], now()).unwrap();

        // Repo 2 reuses repo 1's node id, violating the unique constraint
        let mut clash = create_test_repo(2, 3);
        clash.node_id = "R_1".to_string();
        let err = MergeEngine::merge(
            &mut storage,
            &[create_test_repo(1, 99), create_test_repo(3, 1), clash],
            now() + Duration::hours(1),
        )
        .unwrap_err();

        assert!(err.is_batch_failure());
        assert_eq!(storage.count_repositories().unwrap(), 1);
        assert_eq!(storage.get_repository(1).unwrap().unwrap().repository.stars, 10);
        assert_eq!(storage.count_snapshots().unwrap(), 1);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut storage = create_test_storage();
        let result = MergeEngine::merge(&mut storage, &[], now()).unwrap();
        assert_eq!(result.total(), 0);
    }
}
