//! Configuration module for Star-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use star_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Harvesting with {} credentials", config.credentials.len());
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    default_tiers, ApiConfig, Config, CrawlStrategy, CrawlerConfig, CredentialEntry,
    OutputConfig, QuotaConfig, RetryConfig, RunMode, TierEntry, WorkerConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, load_config, load_config_with_hash, parse_config, resolve_token,
};
