#![forbid(unsafe_code)]

//! `procfleet`: master supervisor binary.
//!
//! Loads a fleet file, starts every configured group and supervises the
//! workers until they all ended or SIGTERM asked for a stop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use procfleet::launcher::Launcher;
use procfleet::logging::TracingSink;
use procfleet::{AppError, FleetConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "procfleet", about = "Supervise local and SSH worker fleets", version, long_about = None)]
struct Cli {
    /// Path to the TOML fleet file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Start the fleet over after each run until SIGTERM.
    #[arg(long)]
    never_exit: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("procfleet master bootstrap");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = FleetConfig::load_from_path(&args.config)?;
    info!(
        groups = config.groups.len(),
        timeout = config.launcher.timeout_seconds,
        "configuration loaded"
    );

    // ── Build launcher ──────────────────────────────────
    let mut launcher = Launcher::master(Arc::new(TracingSink)).with_settings(config.launcher);
    launcher.set_groups(config.groups)?;

    // ── Supervise until every worker ended ──────────────
    let _listener = launcher.spawn_termination_listener();
    launcher.run_master(args.never_exit).await?;

    info!("procfleet shut down");
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
