use serde::Deserialize;

/// Main configuration structure for Star-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub credentials: Vec<CredentialEntry>,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierEntry>,
    pub output: OutputConfig,
}

/// Which candidate set a run walks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStrategy {
    /// Page through the remote search results from the saved cursor
    Discover,
    /// Re-fetch stored repositories that the scheduler reports as due
    Refresh,
}

/// Whether a run stops after one drained pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Once,
    Continuous,
}

/// Crawl loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    pub strategy: CrawlStrategy,

    #[serde(default = "default_mode")]
    pub mode: RunMode,

    /// Entities requested per API call
    #[serde(rename = "page-size", default = "default_page_size")]
    pub page_size: u32,

    /// Due entities pulled from the scheduler per refresh batch
    #[serde(rename = "batch-size", default = "default_batch_size")]
    pub batch_size: u32,

    /// Stop after this many entities have been processed (0 = unbounded)
    #[serde(rename = "max-entities", default)]
    pub max_entities: u64,

    /// Sleep between passes in continuous mode, and fallback quota wait
    #[serde(rename = "idle-interval-secs", default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// Batch failures in a row that abort the run
    #[serde(
        rename = "max-consecutive-batch-failures",
        default = "default_max_batch_failures"
    )]
    pub max_consecutive_batch_failures: u32,
}

/// Identity slice owned by this worker
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerConfig {
    pub id: String,
    pub partition_index: u32,
    pub partition_count: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: "worker-0".to_string(),
            partition_index: 0,
            partition_count: 1,
        }
    }
}

/// Remote API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiConfig {
    /// GraphQL endpoint URL
    pub endpoint: String,

    /// Search expression used by the discover strategy
    #[serde(default = "default_search_query")]
    pub search_query: String,

    /// Timeout applied to each request attempt
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Quota selection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaConfig {
    /// Credentials at or below this remaining budget are not handed out
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u32,

    /// How long `acquire` may wait for a reset before giving up
    #[serde(default)]
    pub acquire_timeout_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            acquire_timeout_secs: 0,
        }
    }
}

/// Retry and backoff configuration for transient fetch failures
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Total attempts per request, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// One API credential and its budget
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CredentialEntry {
    pub id: String,

    /// Inline token; prefer `token-env` outside of tests
    #[serde(default)]
    pub token: Option<String>,

    /// Name of the environment variable holding the token
    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default = "default_max_budget")]
    pub max_budget: u32,

    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
}

/// One row of the staleness tier table
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TierEntry {
    pub name: String,

    /// Upper bound on days since the remote update; absent on the catch-all tier
    #[serde(default)]
    pub max_update_age_days: Option<u32>,

    pub refresh_interval_hours: u32,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

fn default_mode() -> RunMode {
    RunMode::Once
}

fn default_page_size() -> u32 {
    100
}

fn default_batch_size() -> u32 {
    500
}

fn default_idle_interval() -> u64 {
    60
}

fn default_max_batch_failures() -> u32 {
    3
}

fn default_search_query() -> String {
    "stars:>0".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("star-harvest/{}", env!("CARGO_PKG_VERSION"))
}

fn default_safety_margin() -> u32 {
    500
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_budget() -> u32 {
    5000
}

fn default_reset_interval() -> u64 {
    3600
}

/// Daily, weekly, monthly and quarterly refresh tiers
pub fn default_tiers() -> Vec<TierEntry> {
    vec![
        TierEntry {
            name: "daily".to_string(),
            max_update_age_days: Some(7),
            refresh_interval_hours: 24,
        },
        TierEntry {
            name: "weekly".to_string(),
            max_update_age_days: Some(30),
            refresh_interval_hours: 24 * 7,
        },
        TierEntry {
            name: "monthly".to_string(),
            max_update_age_days: Some(90),
            refresh_interval_hours: 24 * 30,
        },
        TierEntry {
            name: "quarterly".to_string(),
            max_update_age_days: None,
            refresh_interval_hours: 24 * 90,
        },
    ]
}
