//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    format_date, format_timestamp, parse_timestamp, Checkpoint, CrawlCandidate, MergeWrites,
    Partition, Repository, RepositoryRecord, RunRecord, RunStatus, SnapshotRecord,
};
use crate::HarvestError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

/// Upper bound on bound parameters per `IN (...)` lookup
const LOOKUP_CHUNK: usize = 500;

const REPO_COLUMNS: &str = "repo_id, node_id, owner, name, url, description, language, \
     stargazers_count, last_repo_updated_at, last_crawled_at, first_seen_at, updated_local_at";

const RUN_COLUMNS: &str = "id, worker_id, strategy, started_at, finished_at, config_hash, status, \
     processed, skipped, failed, final_checkpoint";

/// Moves `last_crawled_at` forward only
const MONOTONIC_CRAWLED: &str = "CASE WHEN last_crawled_at IS NULL OR last_crawled_at < ?1 \
     THEN ?1 ELSE last_crawled_at END";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(HarvestError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn conversion_error(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unparseable timestamp {:?}", raw).into(),
    )
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, &raw))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| parse_timestamp(&raw).ok_or_else(|| conversion_error(idx, &raw)))
        .transpose()
}

fn row_to_repository_record(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        repository: Repository {
            repo_id: row.get(0)?,
            node_id: row.get(1)?,
            owner: row.get(2)?,
            name: row.get(3)?,
            url: row.get(4)?,
            description: row.get(5)?,
            language: row.get(6)?,
            stars: row.get(7)?,
            remote_updated_at: optional_timestamp_column(row, 8)?,
        },
        last_crawled_at: optional_timestamp_column(row, 9)?,
        first_seen_at: timestamp_column(row, 10)?,
        updated_local_at: timestamp_column(row, 11)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        strategy: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        config_hash: row.get(5)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(6)?).unwrap_or(RunStatus::Running),
        processed: row.get::<_, i64>(7)?.max(0) as u64,
        skipped: row.get::<_, i64>(8)?.max(0) as u64,
        failed: row.get::<_, i64>(9)?.max(0) as u64,
        final_checkpoint: row.get(10)?,
    })
}

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        key: row.get(0)?,
        value: row.get(1)?,
        updated_at: timestamp_column(row, 2)?,
    })
}

fn count_to_u64(count: i64) -> u64 {
    count.max(0) as u64
}

fn clamp_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(
        &mut self,
        worker_id: &str,
        strategy: &str,
        config_hash: &str,
    ) -> StorageResult<i64> {
        let now = format_timestamp(Utc::now());
        self.conn.execute(
            "INSERT INTO runs (worker_id, strategy, started_at, config_hash, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                worker_id,
                strategy,
                now,
                config_hash,
                RunStatus::Running.to_db_string()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        self.conn
            .query_row(&sql, params![run_id], row_to_run)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS);
        let run = self.conn.query_row(&sql, [], row_to_run).optional()?;
        Ok(run)
    }

    fn get_recent_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>> {
        let sql = format!("SELECT {} FROM runs ORDER BY id DESC LIMIT ?1", RUN_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![limit], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        processed: u64,
        skipped: u64,
        failed: u64,
        final_checkpoint: Option<&str>,
    ) -> StorageResult<()> {
        let now = format_timestamp(Utc::now());
        let changed = self.conn.execute(
            "UPDATE runs
             SET status = ?1, finished_at = ?2, processed = ?3, skipped = ?4, failed = ?5,
                 final_checkpoint = ?6
             WHERE id = ?7",
            params![
                status.to_db_string(),
                now,
                clamp_count(processed),
                clamp_count(skipped),
                clamp_count(failed),
                final_checkpoint,
                run_id
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    // ===== Repositories =====

    fn get_repository(&self, repo_id: i64) -> StorageResult<Option<RepositoryRecord>> {
        let sql = format!("SELECT {} FROM repos WHERE repo_id = ?1", REPO_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, params![repo_id], row_to_repository_record)
            .optional()?;
        Ok(record)
    }

    fn get_repositories(&self, repo_ids: &[i64]) -> StorageResult<HashMap<i64, RepositoryRecord>> {
        let mut records = HashMap::with_capacity(repo_ids.len());

        for chunk in repo_ids.chunks(LOOKUP_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM repos WHERE repo_id IN ({})",
                REPO_COLUMNS, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), row_to_repository_record)?;
            for record in rows {
                let record = record?;
                records.insert(record.repository.repo_id, record);
            }
        }

        Ok(records)
    }

    fn crawl_candidates(&self, partition: Partition) -> StorageResult<Vec<CrawlCandidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_id, node_id, stargazers_count, last_repo_updated_at, last_crawled_at
             FROM repos ORDER BY repo_id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(CrawlCandidate {
                repo_id: row.get(0)?,
                node_id: row.get(1)?,
                stars: row.get(2)?,
                remote_updated_at: optional_timestamp_column(row, 3)?,
                last_crawled_at: optional_timestamp_column(row, 4)?,
            })
        })?;

        let mut candidates = Vec::new();
        for candidate in rows {
            let candidate = candidate?;
            if partition.contains(candidate.repo_id) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    fn apply_merge(&mut self, writes: &MergeWrites) -> StorageResult<()> {
        let crawled_at = format_timestamp(writes.crawled_at);
        let tx = self.conn.transaction()?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO repos (repo_id, node_id, owner, name, url, description, language,
                     stargazers_count, last_repo_updated_at, last_crawled_at, first_seen_at,
                     updated_local_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10)",
            )?;
            for repo in &writes.inserts {
                insert.execute(params![
                    repo.repo_id,
                    repo.node_id,
                    repo.owner,
                    repo.name,
                    repo.url,
                    repo.description,
                    repo.language,
                    repo.stars,
                    repo.remote_updated_at.map(format_timestamp),
                    crawled_at,
                ])?;
            }

            let update_sql = format!(
                "UPDATE repos
                 SET owner = ?2, name = ?3, url = ?4, description = ?5, language = ?6,
                     stargazers_count = ?7, last_repo_updated_at = ?8, updated_local_at = ?1,
                     last_crawled_at = {}
                 WHERE repo_id = ?9",
                MONOTONIC_CRAWLED
            );
            let mut update = tx.prepare(&update_sql)?;
            for repo in &writes.updates {
                let changed = update.execute(params![
                    crawled_at,
                    repo.owner,
                    repo.name,
                    repo.url,
                    repo.description,
                    repo.language,
                    repo.stars,
                    repo.remote_updated_at.map(format_timestamp),
                    repo.repo_id,
                ])?;
                if changed == 0 {
                    return Err(StorageError::ConstraintViolation(format!(
                        "update for unknown repository {}",
                        repo.repo_id
                    )));
                }
            }

            let touch_sql = format!(
                "UPDATE repos SET last_crawled_at = {} WHERE repo_id = ?2",
                MONOTONIC_CRAWLED
            );
            let mut touch = tx.prepare(&touch_sql)?;
            for repo_id in &writes.touches {
                touch.execute(params![crawled_at, repo_id])?;
            }

            let mut snapshot = tx.prepare(
                "INSERT INTO repo_stars_history (repo_id, snapshot_date, stargazers_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (repo_id, snapshot_date)
                 DO UPDATE SET stargazers_count = excluded.stargazers_count",
            )?;
            for record in &writes.snapshots {
                snapshot.execute(params![
                    record.repo_id,
                    format_date(record.snapshot_date),
                    record.stars
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn count_repositories(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM repos", [], |row| row.get(0))?;
        Ok(count_to_u64(count))
    }

    // ===== History =====

    fn get_history(&self, repo_id: i64) -> StorageResult<Vec<SnapshotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_id, snapshot_date, stargazers_count FROM repo_stars_history
             WHERE repo_id = ?1 ORDER BY snapshot_date",
        )?;

        let rows = stmt.query_map(params![repo_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (repo_id, raw_date, stars) = row?;
            let snapshot_date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d").map_err(|e| {
                StorageError::CorruptRow(format!("snapshot date {:?}: {}", raw_date, e))
            })?;
            history.push(SnapshotRecord {
                repo_id,
                snapshot_date,
                stars,
            });
        }
        Ok(history)
    }

    fn count_snapshots(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM repo_stars_history", [], |row| row.get(0))?;
        Ok(count_to_u64(count))
    }

    fn count_snapshot_days(&self) -> StorageResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(DISTINCT snapshot_date) FROM repo_stars_history",
            [],
            |row| row.get(0),
        )?;
        Ok(count_to_u64(count))
    }

    // ===== Checkpoints =====

    fn load_checkpoint(&self, key: &str) -> StorageResult<Option<Checkpoint>> {
        let checkpoint = self
            .conn
            .query_row(
                "SELECT checkpoint_key, checkpoint_value, updated_at
                 FROM crawl_checkpoints WHERE checkpoint_key = ?1",
                params![key],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(checkpoint)
    }

    fn save_checkpoint(&mut self, key: &str, value: &str) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO crawl_checkpoints (checkpoint_key, checkpoint_value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (checkpoint_key)
             DO UPDATE SET checkpoint_value = excluded.checkpoint_value,
                           updated_at = excluded.updated_at",
            params![key, value, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn clear_checkpoint(&mut self, key: &str) -> StorageResult<()> {
        self.conn.execute(
            "DELETE FROM crawl_checkpoints WHERE checkpoint_key = ?1",
            params![key],
        )?;
        Ok(())
    }

    fn list_checkpoints(&self, prefix: Option<&str>) -> StorageResult<Vec<Checkpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT checkpoint_key, checkpoint_value, updated_at
             FROM crawl_checkpoints ORDER BY checkpoint_key",
        )?;
        let rows = stmt.query_map([], row_to_checkpoint)?;

        let mut checkpoints = Vec::new();
        for checkpoint in rows {
            let checkpoint = checkpoint?;
            if prefix.map_or(true, |p| checkpoint.key.starts_with(p)) {
                checkpoints.push(checkpoint);
            }
        }
        Ok(checkpoints)
    }
}
