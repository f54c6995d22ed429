//! Star-Harvest main entry point
//!
//! This is the command-line interface for the Star-Harvest repository harvester.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use star_harvest::config::{load_config_with_hash, resolve_token, Config, RunMode};
use star_harvest::crawler::Coordinator;
use star_harvest::output::{load_statistics, print_statistics};
use star_harvest::storage::SqliteStorage;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Star-Harvest: an incremental repository metadata harvester
///
/// Star-Harvest pages through a quota-metered GraphQL API, stores repository
/// facts with daily star history, and resumes from durable checkpoints.
#[derive(Parser, Debug)]
#[command(name = "star-harvest")]
#[command(version = "1.0.0")]
#[command(about = "An incremental repository metadata harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Stop after one drained pass, overriding the configured mode
    #[arg(long, conflicts_with = "continuous")]
    once: bool,

    /// Keep harvesting until interrupted, overriding the configured mode
    #[arg(long, conflicts_with = "once")]
    continuous: bool,

    /// Clear this worker's checkpoints before running
    #[arg(long)]
    fresh: bool,

    /// Validate config and show what would be harvested without harvesting
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.once {
        config.crawler.mode = RunMode::Once;
    } else if cli.continuous {
        config.crawler.mode = RunMode::Continuous;
    }

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_harvest(config, config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("star_harvest=info,warn"),
            1 => EnvFilter::new("star_harvest=debug,info"),
            2 => EnvFilter::new("star_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the resolved configuration
fn handle_dry_run(config: &Config) {
    println!("=== Star-Harvest Dry Run ===\n");

    println!("Crawler Configuration:");
    println!("  Strategy: {:?}", config.crawler.strategy);
    println!("  Mode: {:?}", config.crawler.mode);
    println!("  Page size: {}", config.crawler.page_size);
    println!("  Batch size: {}", config.crawler.batch_size);
    match config.crawler.max_entities {
        0 => println!("  Max entities: unbounded"),
        n => println!("  Max entities: {}", n),
    }
    println!("  Idle interval: {}s", config.crawler.idle_interval_secs);

    println!("\nWorker:");
    println!("  Id: {}", config.worker.id);
    println!(
        "  Partition: {} of {}",
        config.worker.partition_index, config.worker.partition_count
    );

    println!("\nAPI:");
    println!("  Endpoint: {}", config.api.endpoint);
    println!("  Search query: {}", config.api.search_query);
    println!("  Request timeout: {}s", config.api.request_timeout_secs);
    println!(
        "  Retries: {} attempts, {}ms..{}ms backoff",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    );

    println!("\nCredentials ({}):", config.credentials.len());
    for entry in &config.credentials {
        let token = match resolve_token(entry) {
            Ok(_) => "token resolved",
            Err(_) => "TOKEN MISSING",
        };
        println!(
            "  - {} (budget {}, reset every {}s, {})",
            entry.id, entry.max_budget, entry.reset_interval_secs, token
        );
    }
    println!("  Safety margin: {}", config.quota.safety_margin);

    println!("\nTiers ({}):", config.tiers.len());
    for tier in &config.tiers {
        let bound = match tier.max_update_age_days {
            Some(days) => format!("updated within {} days", days),
            None => "everything else".to_string(),
        };
        println!(
            "  - {}: {}, refresh every {}h",
            tier.name, bound, tier.refresh_interval_hours
        );
    }

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.output.database_path);

    let storage = SqliteStorage::new(Path::new(&config.output.database_path))
        .context("failed to open database")?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main harvest operation
async fn handle_harvest(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    tracing::info!(
        "Credentials: {}, page size: {}, mode: {:?}",
        config.credentials.len(),
        config.crawler.page_size,
        config.crawler.mode
    );

    let mut coordinator = Coordinator::from_config(config, config_hash)?;
    if fresh {
        tracing::info!("Starting fresh harvest (ignoring saved checkpoints)");
        coordinator.reset_checkpoints()?;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, finishing current iteration");
            on_signal.cancel();
        }
    });

    match coordinator.run(cancel).await {
        Ok(report) => {
            println!("{}", report);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Harvest failed: {}", e);
            Err(e.into())
        }
    }
}
