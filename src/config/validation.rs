use crate::config::types::{
    ApiConfig, Config, CrawlerConfig, CredentialEntry, OutputConfig, QuotaConfig, RetryConfig,
    TierEntry, WorkerConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_worker_config(&config.worker)?;
    validate_api_config(&config.api)?;
    validate_retry_config(&config.retry)?;
    validate_credentials(&config.credentials, &config.quota)?;
    validate_tiers(&config.tiers)?;
    validate_output_config(&config.output)?;
    Ok(())
}

fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.page_size < 1 || config.page_size > 100 {
        return Err(ConfigError::Validation(format!(
            "page-size must be between 1 and 100, got {}",
            config.page_size
        )));
    }

    if config.batch_size < 1 {
        return Err(ConfigError::Validation(
            "batch-size must be >= 1".to_string(),
        ));
    }

    if config.max_consecutive_batch_failures < 1 {
        return Err(ConfigError::Validation(
            "max-consecutive-batch-failures must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_worker_config(config: &WorkerConfig) -> Result<(), ConfigError> {
    if config.id.is_empty() {
        return Err(ConfigError::Validation(
            "worker id cannot be empty".to_string(),
        ));
    }

    // '/' separates the worker id from the checkpoint name
    if config.id.contains('/') {
        return Err(ConfigError::Validation(format!(
            "worker id must not contain '/', got '{}'",
            config.id
        )));
    }

    if config.partition_count < 1 {
        return Err(ConfigError::Validation(
            "partition-count must be >= 1".to_string(),
        ));
    }

    if config.partition_index >= config.partition_count {
        return Err(ConfigError::Validation(format!(
            "partition-index {} is out of range for partition-count {}",
            config.partition_index, config.partition_count
        )));
    }

    Ok(())
}

fn validate_api_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.endpoint)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid endpoint: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "endpoint '{}' must use http or https",
            config.endpoint
        )));
    }

    if config.search_query.trim().is_empty() {
        return Err(ConfigError::Validation(
            "search-query cannot be empty".to_string(),
        ));
    }

    if config.request_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "max-attempts must be >= 1".to_string(),
        ));
    }

    if config.base_delay_ms > config.max_delay_ms {
        return Err(ConfigError::Validation(format!(
            "base-delay-ms ({}) cannot exceed max-delay-ms ({})",
            config.base_delay_ms, config.max_delay_ms
        )));
    }

    Ok(())
}

fn validate_credentials(
    credentials: &[CredentialEntry],
    quota: &QuotaConfig,
) -> Result<(), ConfigError> {
    if credentials.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[credentials]] entry is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for entry in credentials {
        if entry.id.is_empty() {
            return Err(ConfigError::Validation(
                "credential id cannot be empty".to_string(),
            ));
        }

        if !seen.insert(entry.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate credential id '{}'",
                entry.id
            )));
        }

        if entry.token.is_none() && entry.token_env.is_none() {
            return Err(ConfigError::Validation(format!(
                "credential '{}' needs token or token-env",
                entry.id
            )));
        }

        if entry.max_budget <= quota.safety_margin {
            return Err(ConfigError::Validation(format!(
                "credential '{}' max-budget {} must exceed safety-margin {}",
                entry.id, entry.max_budget, quota.safety_margin
            )));
        }

        if entry.reset_interval_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "credential '{}' reset-interval-secs must be >= 1",
                entry.id
            )));
        }
    }

    Ok(())
}

/// Tier boundaries must ascend and end in exactly one catch-all tier
fn validate_tiers(tiers: &[TierEntry]) -> Result<(), ConfigError> {
    let Some((last, bounded)) = tiers.split_last() else {
        return Err(ConfigError::Validation(
            "tier table cannot be empty".to_string(),
        ));
    };

    if last.max_update_age_days.is_some() {
        return Err(ConfigError::Validation(format!(
            "last tier '{}' must omit max-update-age-days",
            last.name
        )));
    }

    let mut previous: Option<u32> = None;
    for tier in bounded {
        let Some(age) = tier.max_update_age_days else {
            return Err(ConfigError::Validation(format!(
                "only the last tier may omit max-update-age-days (found '{}')",
                tier.name
            )));
        };

        if previous.is_some_and(|p| age <= p) {
            return Err(ConfigError::Validation(format!(
                "tier '{}' boundary {}d must be greater than the previous tier",
                tier.name, age
            )));
        }
        previous = Some(age);
    }

    for tier in tiers {
        if tier.name.is_empty() {
            return Err(ConfigError::Validation(
                "tier name cannot be empty".to_string(),
            ));
        }
        if tier.refresh_interval_hours == 0 {
            return Err(ConfigError::Validation(format!(
                "tier '{}' refresh-interval-hours must be >= 1",
                tier.name
            )));
        }
    }

    Ok(())
}

fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }
    Ok(())
}
