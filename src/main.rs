// ABOUTME: CLI entry point for table-replicator
// ABOUTME: Resolves one profile, runs it, and exits non-zero after any recorded failure

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use table_replicator::config::{default_status_dir, ReplicatorConfig};
use table_replicator::{run_profile, StatusStore};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "table-replicator")]
#[command(about = "Replicate one table between databases, in full or incrementally", long_about = None)]
#[command(version)]
struct Cli {
    /// Profile to run, as named in the configuration file
    profile: String,
    /// Force a full (retroactive) replication
    #[arg(short, long)]
    retroactive: bool,
    /// Path to the configuration file
    #[arg(
        short,
        long,
        env = "TABLE_REPLICATOR_CONFIG",
        default_value = "replicator.toml"
    )]
    config: PathBuf,
    /// Directory for run status files (overrides status_dir in the config)
    #[arg(long = "status-dir")]
    status_dir: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
    /// Also append logs to this file
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
    /// Print the last recorded run of the profile and exit
    #[arg(long = "show-status")]
    show_status: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config = ReplicatorConfig::load(&cli.config)?;
    let profile = config.profile(&cli.profile)?;

    let status_dir = match cli.status_dir.clone().or_else(|| config.status_dir.clone()) {
        Some(dir) => dir,
        None => default_status_dir()?,
    };
    let store = StatusStore::new(status_dir);

    if cli.show_status {
        match store.load(&cli.profile)? {
            Some(status) => println!("{}", status.summary()),
            None => println!("No runs recorded for profile '{}'", cli.profile),
        }
        return Ok(ExitCode::SUCCESS);
    }

    match run_profile(&cli.profile, profile, &store, cli.retroactive).await {
        Ok(report) => {
            tracing::info!(
                "{} run of profile '{}' finished: {} inserted, {} deleted, {} updated",
                report.mode,
                cli.profile,
                report.counts.inserted,
                report.counts.deleted,
                report.counts.updated
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!("{} in profile '{}': {}", e.outcome(), cli.profile, e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    // Initialize logging with the specified level
    // RUST_LOG environment variable takes precedence if set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    let file_layer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}
