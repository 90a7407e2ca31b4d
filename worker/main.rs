#![forbid(unsafe_code)]

//! `procfleet-worker`: demo worker binary.
//!
//! Runs the task named by the group command, or acts as the far-side
//! launcher when invoked through SSH with a remote command. Workers talk to
//! their supervisor through stdout, so diagnostics go to stderr.

use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use procfleet::logging::LogContext;
use procfleet::worker::{Worker, WorkerContext};
use procfleet::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "procfleet-worker", about = "Demo procfleet worker", version, long_about = None)]
struct Cli {
    /// Task to run: `child` or `single-line`.
    command: String,

    /// JSON launch parameters written by the supervisor.
    params: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing()?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let worker = Worker::from_json(&args.params)?;
    if worker.is_command() {
        return worker.run(|_| async { Ok(()) }).await;
    }
    match args.command.as_str() {
        "child" => worker.run(child).await,
        "single-line" => {
            worker
                .run(|context| async move {
                    single_line(&context);
                    Ok(())
                })
                .await
        }
        other => Err(AppError::Config(format!("unknown worker task: {other}"))),
    }
}

/// Print a greeting, optionally linger, then exit cleanly.
///
/// Group params: `message` replaces the greeting, `sleep` lingers while
/// honouring stop requests, `forceSleep` lingers ignoring them and
/// `neverDie` never returns.
async fn child(context: WorkerContext) -> Result<()> {
    let params = context.params();
    match params.get("message").and_then(Value::as_str) {
        Some(message) => println!("{message}"),
        None => println!("Child {} {}", context.id(), context.group_id()),
    }

    if let Some(seconds) = seconds_param(params, "sleep") {
        context.sleep(seconds).await;
    } else if let Some(seconds) = seconds_param(params, "forceSleep") {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    } else if params.get("neverDie").and_then(Value::as_bool) == Some(true) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    println!("Child clean exit");
    Ok(())
}

/// Log one record through the supervisor's sink, then exit.
fn single_line(context: &WorkerContext) {
    context.logger().emergency("ONE_LINE", LogContext::new());
}

fn seconds_param(params: &serde_json::Map<String, Value>, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64).filter(|seconds| *seconds > 0)
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}
