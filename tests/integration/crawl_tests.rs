//! Integration tests for the harvester
//!
//! These tests use wiremock to stand in for the GraphQL API and drive the
//! full fetch, merge and checkpoint cycle end-to-end.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::{json, Value};
use star_harvest::config::{parse_config, Config};
use star_harvest::crawler::{
    BackoffPolicy, Coordinator, FetchExecutor, MergeEngine, REFRESH_LAST_ID, SEARCH_CURSOR,
};
use star_harvest::quota::{Credential, QuotaTracker};
use star_harvest::state::CredentialState;
use star_harvest::HarvestError;
use star_harvest::storage::{
    checkpoint_key, Checkpoint, CheckpointStore, MemoryCheckpointStore, Repository, RunStatus,
    SharedStorage, SqliteStorage, Storage, StorageError, StorageResult,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration pointed at the mock server
fn create_test_config(server: &MockServer, strategy: &str, crawler_extra: &str) -> Config {
    parse_config(&format!(
        r#"
[crawler]
strategy = "{strategy}"
mode = "once"
page-size = 10
{crawler_extra}

[worker]
id = "worker-0"
partition-index = 0
partition-count = 1

[api]
endpoint = "{uri}/graphql"

[retry]
max-attempts = 2
base-delay-ms = 1
max-delay-ms = 4

[[credentials]]
id = "primary"
token = "ghp_primary"

[output]
database-path = ":memory:"
"#,
        strategy = strategy,
        crawler_extra = crawler_extra,
        uri = server.uri()
    ))
    .expect("test config should parse")
}

fn create_test_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

fn create_test_tracker(credentials: Vec<(&str, u32)>, margin: u32) -> QuotaTracker {
    let credentials = credentials
        .into_iter()
        .map(|(id, remaining)| {
            let mut state = CredentialState::new(5000, ChronoDuration::hours(1));
            state.remaining = remaining;
            (Credential::new(id, format!("ghp_{}", id)), state)
        })
        .collect();
    QuotaTracker::new(credentials, margin)
}

fn create_test_storage() -> SharedStorage {
    Arc::new(Mutex::new(
        SqliteStorage::new_in_memory().expect("in-memory database"),
    ))
}

fn create_test_coordinator(
    config: Config,
    storage: SharedStorage,
    checkpoints: Arc<dyn CheckpointStore>,
    quota: QuotaTracker,
) -> Coordinator {
    let executor = FetchExecutor::new(
        reqwest::Client::new(),
        config.api.endpoint.clone(),
        create_test_policy(),
        quota.clone(),
    );
    Coordinator::new(config, storage, checkpoints, quota, executor)
}

/// A remote update time two days back, stable for the whole test
fn recent_update() -> DateTime<Utc> {
    (Utc::now() - ChronoDuration::days(2))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
}

fn node(id: i64, stars: u32) -> Value {
    json!({
        "id": format!("R_{}", id),
        "databaseId": id,
        "name": format!("repo-{}", id),
        "owner": {"login": "octo"},
        "url": format!("https://github.com/octo/repo-{}", id),
        "description": "a repository",
        "updatedAt": recent_update().to_rfc3339_opts(SecondsFormat::Secs, true),
        "stargazerCount": stars,
        "primaryLanguage": {"name": "Rust"}
    })
}

fn search_body(nodes: Vec<Value>, next: Option<&str>) -> Value {
    json!({
        "data": {
            "rateLimit": {"limit": 5000, "cost": 1, "remaining": 4990, "resetAt": null},
            "search": {
                "pageInfo": {"hasNextPage": next.is_some(), "endCursor": next},
                "nodes": nodes
            }
        }
    })
}

fn create_test_repo(id: i64, stars: u32) -> Repository {
    Repository {
        repo_id: id,
        node_id: format!("R_{}", id),
        owner: "octo".to_string(),
        name: format!("repo-{}", id),
        url: Some(format!("https://github.com/octo/repo-{}", id)),
        description: Some("a repository".to_string()),
        language: Some("Rust".to_string()),
        stars,
        remote_updated_at: Some(recent_update()),
    }
}

/// Mounts a two-page search: page one ends at `cursor-1`, page two is the last
async fn mount_two_page_search(server: &MockServer, first_page_hits: u64) {
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":null"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(vec![node(1, 100), node(2, 50)], Some("cursor-1"))),
        )
        .expect(first_page_hits)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":\"cursor-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![node(3, 10)], None)))
        .expect(1)
        .mount(server)
        .await;
}

/// A checkpoint store whose first saves fail, as if the process died
/// between committing a merge and recording the cursor
struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    failures_left: AtomicU32,
}

impl FlakyCheckpointStore {
    fn new() -> Self {
        Self::failing(1)
    }

    fn failing(times: u32) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            failures_left: AtomicU32::new(times),
        }
    }
}

impl CheckpointStore for FlakyCheckpointStore {
    fn load(&self, key: &str) -> StorageResult<Option<Checkpoint>> {
        self.inner.load(key)
    }

    fn save(&self, key: &str, value: &str) -> StorageResult<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Database("disk I/O error".to_string()));
        }
        self.inner.save(key, value)
    }

    fn clear(&self, key: &str) -> StorageResult<()> {
        self.inner.clear(key)
    }
}

#[tokio::test]
async fn test_discover_crawl_walks_every_page() {
    let server = MockServer::start().await;
    mount_two_page_search(&server, 1).await;

    let storage = create_test_storage();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        checkpoints.clone(),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.pages, 2);
    assert_eq!(report.processed, 3);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.final_checkpoint, None);

    let db = storage.lock().unwrap();
    assert_eq!(db.count_repositories().unwrap(), 3);
    assert_eq!(db.count_snapshots().unwrap(), 3);
    let repo = db.get_repository(1).unwrap().unwrap();
    assert_eq!(repo.repository.stars, 100);
    assert_eq!(repo.repository.owner, "octo");

    // Exhausting the search clears the cursor so the next pass starts over
    let key = checkpoint_key("worker-0", SEARCH_CURSOR);
    assert!(checkpoints.load(&key).unwrap().is_none());

    let run = db.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.processed, 3);
}

#[tokio::test]
async fn test_discover_resumes_from_saved_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":\"cursor-1\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![node(3, 10)], None)))
        .expect(1)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let key = checkpoint_key("worker-0", SEARCH_CURSOR);
    checkpoints.save(&key, "cursor-1").unwrap();

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        checkpoints,
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(storage.lock().unwrap().count_repositories().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_checkpoint_write_refetches_page_without_duplicates() {
    let server = MockServer::start().await;
    // Page one is fetched again because its cursor was never recorded
    mount_two_page_search(&server, 2).await;

    let storage = create_test_storage();
    let checkpoints = Arc::new(FlakyCheckpointStore::new());
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        checkpoints,
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.batch_failures, 1);
    // The first merge of page one committed but its batch failed, so only the
    // refetch is counted and finds those rows already current
    assert_eq!(report.inserted, 1);
    assert_eq!(report.unchanged, 2);

    let db = storage.lock().unwrap();
    assert_eq!(db.count_repositories().unwrap(), 3);
    assert_eq!(db.count_snapshots().unwrap(), 3);
    assert_eq!(db.get_history(1).unwrap().len(), 1);
}

#[tokio::test]
async fn test_fetch_failure_leaves_cursor_in_place() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let key = checkpoint_key("worker-0", SEARCH_CURSOR);
    checkpoints.save(&key, "cursor-7").unwrap();

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        checkpoints.clone(),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.failed_pages, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(checkpoints.load(&key).unwrap().unwrap().value, "cursor-7");
    assert_eq!(report.final_checkpoint.as_deref(), Some("cursor-7"));

    let db = storage.lock().unwrap();
    assert_eq!(db.count_repositories().unwrap(), 0);
    let run = db.get_latest_run().unwrap().unwrap();
    assert_eq!(run.final_checkpoint.as_deref(), Some("cursor-7"));
}

#[tokio::test]
async fn test_entity_limit_stops_after_allowance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"first\":2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(vec![node(1, 100), node(2, 50)], Some("cursor-1"))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", "max-entities = 2"),
        create_test_storage(),
        checkpoints.clone(),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.processed, 2);
    assert_eq!(report.final_checkpoint.as_deref(), Some("cursor-1"));
    let key = checkpoint_key("worker-0", SEARCH_CURSOR);
    assert_eq!(checkpoints.load(&key).unwrap().unwrap().value, "cursor-1");
}

#[tokio::test]
async fn test_refresh_updates_due_repositories_and_skips_missing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("R_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "rateLimit": {"cost": 1, "remaining": 4990, "resetAt": null},
                "nodes": [node(1, 31), null, node(3, 10)]
            },
            "errors": [{"type": "NOT_FOUND", "message": "Could not resolve to a node with the global id of 'R_2'"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Seeded ten days ago; the daily tier makes every row due
    let storage = create_test_storage();
    let seeded_at = Utc::now() - ChronoDuration::days(10);
    {
        let mut db = storage.lock().unwrap();
        let seed = vec![
            create_test_repo(1, 30),
            create_test_repo(2, 20),
            create_test_repo(3, 10),
        ];
        MergeEngine::merge(&mut *db, &seed, seeded_at).unwrap();
    }

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "refresh", ""),
        storage.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.final_checkpoint.as_deref(), Some("3"));

    let db = storage.lock().unwrap();
    assert_eq!(db.get_repository(1).unwrap().unwrap().repository.stars, 31);
    assert_eq!(db.get_history(1).unwrap().len(), 2);

    // The missing repository keeps its old crawl time
    let missing = db.get_repository(2).unwrap().unwrap();
    assert!(missing.last_crawled_at.unwrap() < Utc::now() - ChronoDuration::days(9));
    let refreshed = db.get_repository(3).unwrap().unwrap();
    assert!(refreshed.last_crawled_at.unwrap() > Utc::now() - ChronoDuration::hours(1));
}

#[tokio::test]
async fn test_refresh_with_nothing_due_makes_no_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    {
        let mut db = storage.lock().unwrap();
        MergeEngine::merge(&mut *db, &[create_test_repo(1, 30)], Utc::now()).unwrap();
    }

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "refresh", ""),
        storage,
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.pages, 0);
}

#[tokio::test]
async fn test_credential_below_margin_is_passed_over() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer ghp_secondary"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "rateLimit": {"limit": 5000, "cost": 1, "remaining": 3999, "resetAt": null},
                "search": {
                    "pageInfo": {"hasNextPage": false, "endCursor": null},
                    "nodes": [node(1, 5)]
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let quota = create_test_tracker(vec![("primary", 50), ("secondary", 4000)], 100);
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        create_test_storage(),
        Arc::new(MemoryCheckpointStore::new()),
        quota.clone(),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.quota_waits, 0);
    assert_eq!(quota.remaining("primary"), Some(50));
    assert_eq!(quota.remaining("secondary"), Some(3999));
}

#[tokio::test]
async fn test_discover_keeps_only_own_partition() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(vec![node(1, 100), node(2, 50)], None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Worker 0 of 2 owns the even repository ids
    let mut config = create_test_config(&server, "discover", "");
    config.worker.partition_count = 2;

    let storage = create_test_storage();
    let mut coordinator = create_test_coordinator(
        config,
        storage.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.processed, 1);
    assert_eq!(report.foreign, 1);
    assert_eq!(report.skipped, 0);

    let db = storage.lock().unwrap();
    assert_eq!(db.count_repositories().unwrap(), 1);
    assert!(db.get_repository(1).unwrap().is_none());
    assert!(db.get_repository(2).unwrap().is_some());
}

#[tokio::test]
async fn test_failed_merge_retries_same_page() {
    let server = MockServer::start().await;
    // Repository 1 first arrives under a node id already held by repository 9
    let mut reused = node(1, 100);
    reused["id"] = json!("R_9");
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":null"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![reused], None)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("\"after\":null"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(search_body(vec![node(1, 100), node(2, 50)], None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    {
        let mut db = storage.lock().unwrap();
        MergeEngine::merge(&mut *db, &[create_test_repo(9, 5)], Utc::now()).unwrap();
    }

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.batch_failures, 1);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.pages, 1);

    let db = storage.lock().unwrap();
    assert_eq!(db.count_repositories().unwrap(), 3);
    assert_eq!(db.get_repository(1).unwrap().unwrap().repository.node_id, "R_1");
}

#[tokio::test]
async fn test_repeated_merge_failures_fail_the_run() {
    let server = MockServer::start().await;
    let mut reused = node(1, 100);
    reused["id"] = json!("R_9");
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(search_body(vec![reused], Some("cursor-1"))),
        )
        .expect(2)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    {
        let mut db = storage.lock().unwrap();
        MergeEngine::merge(&mut *db, &[create_test_repo(9, 5)], Utc::now()).unwrap();
    }

    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", "max-consecutive-batch-failures = 2"),
        storage.clone(),
        checkpoints.clone(),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HarvestError::MergeFailed(_)));

    let db = storage.lock().unwrap();
    assert!(db.get_repository(1).unwrap().is_none());
    let run = db.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.final_checkpoint, None);

    let key = checkpoint_key("worker-0", SEARCH_CURSOR);
    assert!(checkpoints.load(&key).unwrap().is_none());
}

#[tokio::test]
async fn test_repeated_checkpoint_failures_fail_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(search_body(vec![node(1, 100)], Some("cursor-1"))),
        )
        .expect(2)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", "max-consecutive-batch-failures = 2"),
        storage.clone(),
        Arc::new(FlakyCheckpointStore::failing(u32::MAX)),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HarvestError::CheckpointWriteFailed { .. }));

    let db = storage.lock().unwrap();
    let run = db.get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    // The merge itself committed, only the cursor never moved
    assert_eq!(db.count_repositories().unwrap(), 1);
    assert_eq!(db.count_snapshots().unwrap(), 1);
}

#[tokio::test]
async fn test_refresh_retries_sub_page_after_checkpoint_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_string_contains("R_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "rateLimit": {"cost": 1, "remaining": 4990, "resetAt": null},
                "nodes": [node(1, 31), node(2, 20)]
            }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    let seeded_at = Utc::now() - ChronoDuration::days(10);
    {
        let mut db = storage.lock().unwrap();
        let seed = vec![create_test_repo(1, 30), create_test_repo(2, 20)];
        MergeEngine::merge(&mut *db, &seed, seeded_at).unwrap();
    }

    let checkpoints = Arc::new(FlakyCheckpointStore::new());
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "refresh", ""),
        storage.clone(),
        checkpoints.clone(),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.batch_failures, 1);
    // The first attempt's update committed before its checkpoint write failed
    assert_eq!(report.updated, 0);
    assert_eq!(report.unchanged, 2);
    assert_eq!(report.final_checkpoint.as_deref(), Some("2"));

    let key = checkpoint_key("worker-0", REFRESH_LAST_ID);
    assert_eq!(checkpoints.load(&key).unwrap().unwrap().value, "2");

    let db = storage.lock().unwrap();
    assert_eq!(db.get_repository(1).unwrap().unwrap().repository.stars, 31);
    assert_eq!(db.get_history(1).unwrap().len(), 2);
}

#[tokio::test]
async fn test_quota_wait_resumes_after_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![node(1, 5)], None)))
        .expect(1)
        .mount(&server)
        .await;

    let mut state = CredentialState::new(5000, ChronoDuration::hours(1));
    state.remaining = 10;
    state.reset_at = Some(Utc::now() + ChronoDuration::milliseconds(50));
    let quota = QuotaTracker::new(vec![(Credential::new("primary", "ghp_primary"), state)], 100);

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        create_test_storage(),
        Arc::new(MemoryCheckpointStore::new()),
        quota.clone(),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.quota_waits, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(quota.remaining("primary"), Some(4990));
}

#[tokio::test]
async fn test_rejected_credential_hands_page_to_another() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer ghp_primary"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer ghp_secondary"))
        .respond_with(ResponseTemplate::new(200).set_body_json(search_body(vec![node(1, 5)], None)))
        .expect(1)
        .mount(&server)
        .await;

    let quota = create_test_tracker(vec![("primary", 4000), ("secondary", 3000)], 100);
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        create_test_storage(),
        Arc::new(MemoryCheckpointStore::new()),
        quota.clone(),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed_pages, 0);
    assert!(quota.is_revoked("primary"));
    assert!(!quota.is_revoked("secondary"));
}

#[tokio::test]
async fn test_every_credential_rejected_fails_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .expect(1)
        .mount(&server)
        .await;

    let storage = create_test_storage();
    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        storage.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let err = coordinator.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HarvestError::CredentialsRevoked));
    let run = storage.lock().unwrap().get_latest_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_search_hits_without_identity_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(search_body(vec![node(1, 5), json!({})], None)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut coordinator = create_test_coordinator(
        create_test_config(&server, "discover", ""),
        create_test_storage(),
        Arc::new(MemoryCheckpointStore::new()),
        create_test_tracker(vec![("primary", 5000)], 100),
    );

    let report = coordinator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    let run = coordinator
        .storage()
        .lock()
        .unwrap()
        .get_latest_run()
        .unwrap()
        .unwrap();
    assert_eq!(run.skipped, 1);
}
