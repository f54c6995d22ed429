//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Star-Harvest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Track harvest runs
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    config_hash TEXT NOT NULL,
    status TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    final_checkpoint TEXT
);

-- Canonical repository rows, one per remote id
CREATE TABLE IF NOT EXISTS repos (
    repo_id INTEGER PRIMARY KEY,
    node_id TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    url TEXT,
    description TEXT,
    language TEXT,
    stargazers_count INTEGER NOT NULL DEFAULT 0,
    last_repo_updated_at TEXT,
    last_crawled_at TEXT,
    first_seen_at TEXT NOT NULL,
    updated_local_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_repos_last_crawled ON repos(last_crawled_at);
CREATE INDEX IF NOT EXISTS idx_repos_stars ON repos(stargazers_count);

-- One star count per repository per UTC day
CREATE TABLE IF NOT EXISTS repo_stars_history (
    repo_id INTEGER NOT NULL REFERENCES repos(repo_id),
    snapshot_date TEXT NOT NULL,
    stargazers_count INTEGER NOT NULL,
    PRIMARY KEY (repo_id, snapshot_date)
);

-- Named crawl cursors
CREATE TABLE IF NOT EXISTS crawl_checkpoints (
    checkpoint_key TEXT PRIMARY KEY,
    checkpoint_value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
