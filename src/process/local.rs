//! Local subprocess transport.
//!
//! Spawns `<bin_path> <command> <json>` with piped stdio. stdout and stderr
//! each get a reader task ([`super::reader::run_reader`]); both feed the same
//! channel, so lines of the two streams interleave in arrival order.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{reader, tree, BoxFuture, HandleLogger, LaunchSpec, LineRead, Transport};
use crate::logging::LogLevel;
use crate::{AppError, Result};

/// Host name reported by local handles.
pub const LOCAL_HOST: &str = "localhost";

/// Locale every local worker runs under.
const WORKER_LOCALE: &str = "en_US.UTF-8";

/// How long a dead worker's pipes may stay open (held by orphaned
/// descendants) before the stream is reported closed.
const EXITED_GRACE: Duration = Duration::from_millis(500);

/// Live resources of one spawned worker.
#[derive(Debug)]
struct Spawned {
    child: Child,
    pid: u32,
    // Held so the worker never sees EOF on stdin while supervised.
    _stdin: Option<ChildStdin>,
    lines: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    exited_at: Option<Instant>,
}

/// Pipe-backed subprocess on the master's host.
#[derive(Debug, Default)]
pub struct LocalTransport {
    spawned: Option<Spawned>,
    bin_path: Option<PathBuf>,
}

impl LocalTransport {
    /// Transport with nothing spawned yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid of the running worker.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.spawned.as_ref().map(|spawned| spawned.pid)
    }

    async fn spawn(&mut self, spec: &LaunchSpec) -> Result<()> {
        let bin_path = spec.bin_path();
        let params = spec.launch_params().to_json()?;

        let mut child = Command::new(&bin_path)
            .arg(&spec.group.command)
            .arg(params)
            .current_dir(spec.work_dir())
            .env_clear()
            .envs(worker_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                AppError::Process(format!("failed to spawn {}: {err}", bin_path.display()))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Process("worker exited before supervision began".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("failed to capture worker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("failed to capture worker stderr".into()))?;

        let (line_tx, lines) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(reader::run_reader(
            "stdout",
            stdout,
            line_tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(reader::run_reader("stderr", stderr, line_tx, cancel.clone()));

        if let Some(priority) = spec.priority() {
            apply_priority(pid, priority).await;
        }

        debug!(pid, bin = %bin_path.display(), "local worker spawned");
        self.bin_path = Some(bin_path);
        self.spawned = Some(Spawned {
            _stdin: child.stdin.take(),
            child,
            pid,
            lines,
            cancel,
            exited_at: None,
        });
        Ok(())
    }
}

impl Transport for LocalTransport {
    fn host(&self) -> &str {
        LOCAL_HOST
    }

    fn launch<'a>(
        &'a mut self,
        spec: &'a LaunchSpec,
        log: &'a HandleLogger,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.spawn(spec).await {
                Ok(()) => true,
                Err(err) => {
                    log.log(LogLevel::Error, &format!("Failed to start: {err}"));
                    false
                }
            }
        })
    }

    fn send_signal<'a>(
        &'a mut self,
        _spec: &'a LaunchSpec,
        _log: &'a HandleLogger,
        signal: Signal,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(pid) = self.pid() else {
                return;
            };
            if signal == Signal::SIGKILL {
                tree::kill_tree(pid, signal);
                return;
            }
            // The worker may run under an interposed shell: prefer the
            // process actually running the configured binary.
            let matched = self
                .bin_path
                .as_deref()
                .map_or(0, |bin| tree::kill_binary(bin, pid, signal));
            if matched == 0 {
                tree::signal_pid(pid, signal);
            }
        })
    }

    fn release(&mut self) {
        let Some(mut spawned) = self.spawned.take() else {
            return;
        };
        spawned.cancel.cancel();
        if matches!(spawned.child.try_wait(), Ok(Some(_))) {
            return;
        }
        // No worker outlives its handle, even one that ignored SIGTERM or
        // closed its pipes early.
        debug!(pid = spawned.pid, "worker still alive on release, killing its tree");
        tree::kill_tree(spawned.pid, Signal::SIGKILL);
        let mut child = spawned.child;
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }

    fn read_line(&mut self) -> LineRead {
        let Some(spawned) = self.spawned.as_mut() else {
            return LineRead::Closed;
        };
        match spawned.lines.try_recv() {
            Ok(line) => LineRead::Line(line),
            Err(TryRecvError::Disconnected) => LineRead::Closed,
            Err(TryRecvError::Empty) => {
                if spawned.exited_at.is_none() && matches!(spawned.child.try_wait(), Ok(Some(_))) {
                    spawned.exited_at = Some(Instant::now());
                }
                match spawned.exited_at {
                    Some(exited_at) if exited_at.elapsed() >= EXITED_GRACE => LineRead::Closed,
                    _ => LineRead::Empty,
                }
            }
        }
    }
}

/// Environment of a spawned worker: a fixed UTF-8 locale plus the master's
/// `PATH`, nothing else.
fn worker_env() -> Vec<(&'static str, OsString)> {
    let mut env = vec![
        ("LANG", OsString::from(WORKER_LOCALE)),
        ("LC_ALL", OsString::from(WORKER_LOCALE)),
    ];
    if let Some(path) = std::env::var_os("PATH") {
        env.push(("PATH", path));
    }
    env
}

async fn apply_priority(pid: u32, priority: i32) {
    let outcome = Command::new("renice")
        .arg("-n")
        .arg(priority.to_string())
        .arg("-p")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match outcome {
        Ok(status) if status.success() => debug!(pid, priority, "priority applied"),
        Ok(status) => debug!(pid, priority, %status, "renice refused"),
        Err(err) => debug!(pid, priority, %err, "renice unavailable"),
    }
}
