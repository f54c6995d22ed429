//! Fetch executor for the repository API
//!
//! This module handles every request the harvester sends, including:
//! - Building the HTTP client from the `[api]` section
//! - Retrying transient failures on an exponential backoff schedule
//! - Classifying failures as transient or permanent
//! - Reporting the quota cost of every attempt, successful or not

use crate::config::{ApiConfig, Config, RetryConfig};
use crate::crawler::query::{GraphQlResponse, PageRequest, ResponseData};
use crate::quota::{Credential, QuotaTracker};
use crate::state::QuotaHint;
use crate::storage::Repository;
use crate::HarvestError;
use chrono::DateTime;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Longest response excerpt carried in an error
const CAUSE_EXCERPT: usize = 200;

/// One page of results
#[derive(Debug, Clone, Default)]
pub struct FetchedPage {
    /// Repositories decoded from the response
    pub items: Vec<Repository>,

    /// Cursor for the following page; None exactly when `exhausted`
    pub next_cursor: Option<String>,

    /// True when no further page exists for this candidate set
    pub exhausted: bool,

    /// Requested node ids the API did not return
    pub missing: Vec<String>,

    /// Search nodes dropped because they carried no usable identity
    pub unidentified: u32,

    /// Quota figures the API reported on the final attempt
    pub quota: Option<QuotaHint>,

    /// Attempts spent, including the successful one
    pub attempts: u32,
}

/// Errors returned by the fetch executor
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient failure that survived every retry
    #[error("gave up after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: String },

    /// Permanent failure
    #[error("rejected: {cause}")]
    Rejected { cause: String },

    /// The credential was refused; the request itself may succeed with another
    #[error("credential refused: {cause}")]
    Unauthorized { cause: String },
}

impl From<FetchError> for HarvestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Exhausted { attempts, cause } => HarvestError::FetchFailed { attempts, cause },
            FetchError::Rejected { cause } | FetchError::Unauthorized { cause } => {
                HarvestError::FetchRejected { cause }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Classifies a non-success status
///
/// A 403 is only transient when it carries a rate limit signal; otherwise it
/// means the credential lacks access.
pub fn classify_status(status: StatusCode, rate_limited: bool) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limited)
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts per request, the first one included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Returns the delays to sleep between consecutive attempts
    pub fn delays(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
        }
    }
}

/// Iterator over retry delays
///
/// Yields one delay per permitted retry; `None` means the ceiling is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.retries + 1 >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.retries);
        self.retries += 1;
        Some(delay)
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The API configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &ApiConfig) -> Result<Client, reqwest::Error> {
    let timeout = Duration::from_secs(config.request_timeout_secs.max(1));

    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .gzip(true)
        .brotli(true)
        .build()
}

enum AttemptOutcome {
    Page(FetchedPage),
    Retry(String),
    Reject(String),
    Unauthorized(String),
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(CAUSE_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Reads the `x-ratelimit-remaining` and `x-ratelimit-reset` headers
fn hint_from_headers(headers: &HeaderMap) -> Option<QuotaHint> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    };

    let remaining = header("x-ratelimit-remaining")?.parse::<u32>().ok()?;
    let reset_at = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    Some(QuotaHint {
        remaining,
        reset_at,
    })
}

/// Issues page requests with retry and quota accounting
pub struct FetchExecutor {
    client: Client,
    endpoint: String,
    policy: BackoffPolicy,
    quota: QuotaTracker,
}

impl FetchExecutor {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        policy: BackoffPolicy,
        quota: QuotaTracker,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            policy,
            quota,
        }
    }

    /// Builds an executor from the `[api]` and `[retry]` sections
    pub fn from_config(config: &Config, quota: QuotaTracker) -> Result<Self, HarvestError> {
        let client = build_http_client(&config.api)?;
        Ok(Self::new(
            client,
            config.api.endpoint.clone(),
            BackoffPolicy::from_config(&config.retry),
            quota,
        ))
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Fetches one page, retrying transient failures
    ///
    /// # Arguments
    ///
    /// * `credential` - The credential to bill
    /// * `request` - What to fetch
    ///
    /// # Returns
    ///
    /// * `Ok(FetchedPage)` - The decoded page
    /// * `Err(FetchError::Exhausted)` - Transient failures outlasted the retry ceiling
    /// * `Err(FetchError::Rejected)` - Permanent failure, not retried
    pub async fn fetch_page(
        &self,
        credential: &Credential,
        request: &PageRequest,
    ) -> Result<FetchedPage, FetchError> {
        let mut delays = self.policy.delays();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(credential, request).await {
                AttemptOutcome::Page(mut page) => {
                    page.attempts = attempts;
                    return Ok(page);
                }
                AttemptOutcome::Reject(cause) => {
                    tracing::debug!("Request rejected on attempt {}: {}", attempts, cause);
                    return Err(FetchError::Rejected { cause });
                }
                AttemptOutcome::Unauthorized(cause) => {
                    self.quota.revoke(&credential.id);
                    return Err(FetchError::Unauthorized { cause });
                }
                AttemptOutcome::Retry(cause) => match delays.next() {
                    Some(delay) => {
                        tracing::warn!(
                            "Attempt {} failed ({}), retrying in {:?}",
                            attempts,
                            cause,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(FetchError::Exhausted { attempts, cause }),
                },
            }
        }
    }

    /// Sends one request and reports its cost
    async fn attempt(&self, credential: &Credential, request: &PageRequest) -> AttemptOutcome {
        let sent = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&credential.token)
            .json(&request.to_body())
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.quota.report(&credential.id, 1, None);
                return match classify_reqwest_error(&e) {
                    RetryDisposition::Retryable => AttemptOutcome::Retry(e.to_string()),
                    RetryDisposition::NonRetryable => AttemptOutcome::Reject(e.to_string()),
                };
            }
        };

        let status = response.status();
        let header_hint = hint_from_headers(response.headers());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.quota.report(&credential.id, 1, header_hint);
                return AttemptOutcome::Retry(format!("failed to read body: {}", e));
            }
        };

        if !status.is_success() {
            self.quota.report(&credential.id, 1, header_hint);
            let rate_limited = header_hint.map_or(false, |h| h.remaining == 0)
                || body.to_ascii_lowercase().contains("rate limit");
            let cause = format!("HTTP {}: {}", status.as_u16(), excerpt(&body));
            if status == StatusCode::UNAUTHORIZED {
                return AttemptOutcome::Unauthorized(cause);
            }
            return match classify_status(status, rate_limited) {
                RetryDisposition::Retryable => AttemptOutcome::Retry(cause),
                RetryDisposition::NonRetryable => AttemptOutcome::Reject(cause),
            };
        }

        let decoded: GraphQlResponse = match serde_json::from_str(&body) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.quota.report(&credential.id, 1, header_hint);
                return AttemptOutcome::Retry(format!("undecodable response: {}", e));
            }
        };

        let rate_limit = decoded.data.as_ref().and_then(|d| d.rate_limit.clone());
        let cost = rate_limit.as_ref().and_then(|r| r.cost).unwrap_or(1);
        let hint = rate_limit
            .map(|r| QuotaHint {
                remaining: r.remaining,
                reset_at: r.reset_at,
            })
            .or(header_hint);
        self.quota.report(&credential.id, cost, hint);

        let data = match decoded.data {
            Some(data) if !decoded.errors.iter().any(|e| e.is_rate_limited()) => data,
            _ => {
                let cause = decoded
                    .errors
                    .iter()
                    .map(|e| e.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                if decoded.errors.iter().any(|e| e.is_rate_limited()) {
                    return AttemptOutcome::Retry(format!("GraphQL rate limited: {}", cause));
                }
                return AttemptOutcome::Reject(format!("GraphQL errors: {}", cause));
            }
        };

        for error in &decoded.errors {
            tracing::debug!("GraphQL partial error: {}", error.message);
        }

        match decode_page(request, data, hint) {
            Ok(page) => AttemptOutcome::Page(page),
            Err(cause) => AttemptOutcome::Reject(cause),
        }
    }
}

fn decode_page(
    request: &PageRequest,
    data: ResponseData,
    quota: Option<QuotaHint>,
) -> Result<FetchedPage, String> {
    match request {
        PageRequest::Search { .. } => {
            let search = data
                .search
                .ok_or_else(|| "response has no search field".to_string())?;

            let mut items = Vec::with_capacity(search.nodes.len());
            let mut unidentified = 0;
            for node in search.nodes {
                let label = node
                    .as_ref()
                    .and_then(|n| n.id.clone())
                    .unwrap_or_else(|| "<unknown>".to_string());
                match node.and_then(|n| n.into_repository()) {
                    Some(repo) => items.push(repo),
                    None => {
                        tracing::warn!("Skipping search node {} without identity", label);
                        unidentified += 1;
                    }
                }
            }

            let next_cursor = if search.page_info.has_next_page {
                search.page_info.end_cursor
            } else {
                None
            };

            Ok(FetchedPage {
                items,
                exhausted: next_cursor.is_none(),
                next_cursor,
                missing: Vec::new(),
                unidentified,
                quota,
                attempts: 0,
            })
        }
        PageRequest::Nodes { ids } => {
            let mut nodes = data
                .nodes
                .ok_or_else(|| "response has no nodes field".to_string())?
                .into_iter();

            let mut items = Vec::with_capacity(ids.len());
            let mut missing = Vec::new();
            for id in ids {
                match nodes.next().flatten().and_then(|n| n.into_repository()) {
                    Some(repo) => items.push(repo),
                    None => missing.push(id.clone()),
                }
            }

            Ok(FetchedPage {
                items,
                next_cursor: None,
                exhausted: true,
                missing,
                unidentified: 0,
                quota,
                attempts: 0,
            })
        }
    }
}
