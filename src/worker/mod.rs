//! Worker-side bootstrap.
//!
//! A worker binary hands its argv to [`Worker::from_args`] and its task to
//! [`Worker::run`]. When the parameters carry a remote command, the worker
//! acts as the far-side launcher instead: `launch` runs a relay
//! [`Launcher`] over the forwarded config and `kill` signals the relay
//! launched earlier for the same config, found through its pid file.

use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{sha256_hex, GroupConfig, LauncherSettings, ProcessConfig};
use crate::launcher::Launcher;
use crate::logging::ProcessLogger;
use crate::observer::ObserverRegistry;
use crate::process::tree;
use crate::protocol::params::{CommandName, LaunchParams, RemoteCommand};
use crate::protocol::{self, Pinger};
use crate::registry::IdRange;
use crate::{signals, AppError, Result};

/// Granularity of [`WorkerContext::sleep`].
const SLEEP_TICK: Duration = Duration::from_millis(30);

// ── Context ──────────────────────────────────────────────────────────────────

struct ContextInner {
    id: u32,
    group_id: u32,
    group_count: u32,
    group: GroupConfig,
    stop: CancellationToken,
    pinger: Pinger,
    logger: ProcessLogger,
}

/// What a worker task sees of its supervision.
///
/// Cheap to clone; every clone shares the same stop flag.
#[derive(Clone)]
pub struct WorkerContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("id", &self.inner.id)
            .field("group_id", &self.inner.group_id)
            .field("group", &self.inner.group.name)
            .field("must_stop", &self.must_stop())
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    fn new(params: &LaunchParams) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: params.id,
                group_id: params.group_id,
                group_count: params.group_count,
                group: params.group_config.clone(),
                stop: CancellationToken::new(),
                pinger: Pinger::new(),
                logger: ProcessLogger::relay(),
            }),
        }
    }

    /// Run-unique id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Id within the group, starting at 1.
    #[must_use]
    pub fn group_id(&self) -> u32 {
        self.inner.group_id
    }

    /// Number of processes in the group.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.inner.group_count
    }

    /// Config of the group this worker belongs to.
    #[must_use]
    pub fn group_config(&self) -> &GroupConfig {
        &self.inner.group
    }

    /// Free-form group parameters.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.inner.group.params
    }

    /// Whether the supervisor asked this worker to stop.
    #[must_use]
    pub fn must_stop(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Request a stop, as SIGTERM does.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    /// Token cancelled when a stop is requested.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Emit a keep-alive line if one is due.
    pub fn ping(&self) {
        self.inner.pinger.ping();
    }

    /// Logger whose records reach the master's sink.
    #[must_use]
    pub fn logger(&self) -> &ProcessLogger {
        &self.inner.logger
    }

    /// Sleep `seconds` while keeping the supervisor fed with pings.
    ///
    /// Returns `false`, early, once a stop is requested.
    pub async fn sleep(&self, seconds: u64) -> bool {
        let duration = Duration::from_secs(seconds);
        let started = Instant::now();
        while started.elapsed() < duration {
            if self.must_stop() {
                return false;
            }
            tokio::time::sleep(SLEEP_TICK).await;
            self.ping();
        }
        !self.must_stop()
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Decoded worker invocation.
#[derive(Debug)]
pub struct Worker {
    params: LaunchParams,
    observers: ObserverRegistry,
}

impl Worker {
    /// Decode the JSON parameter document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the document is malformed.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(Self {
            params: LaunchParams::from_json(raw)?,
            observers: ObserverRegistry::new(),
        })
    }

    /// Decode `argv`: binary, command name, JSON parameters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the parameters are missing or malformed.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let raw = args
            .into_iter()
            .nth(2)
            .ok_or_else(|| AppError::Config("missing worker parameters argument".into()))?;
        Self::from_json(&raw)
    }

    /// Observer kinds a remote `launch` may name.
    #[must_use]
    pub fn with_observers(mut self, observers: ObserverRegistry) -> Self {
        self.observers = observers;
        self
    }

    /// Decoded parameters.
    #[must_use]
    pub fn params(&self) -> &LaunchParams {
        &self.params
    }

    /// Whether this invocation carries a remote command.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.params.remote.is_some()
    }

    /// Run `task`, or the remote command the parameters carry.
    ///
    /// SIGTERM sets the context's stop flag while `task` runs. The end
    /// sentinel is written once `task` returns.
    ///
    /// # Errors
    ///
    /// Propagates the task's error, or the remote command's.
    pub async fn run<F, Fut>(self, task: F) -> Result<()>
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(remote) = self.params.remote.clone() {
            return self.handle_command(remote).await;
        }

        let context = WorkerContext::new(&self.params);
        let listener = CancellationToken::new();
        let stop = context.stop_token();
        signals::spawn_signal_task(listener.clone(), move || stop.cancel());

        let result = task(context).await;
        listener.cancel();
        protocol::send_ended();
        result
    }

    async fn handle_command(&self, remote: RemoteCommand) -> Result<()> {
        let signal = remote.signal()?;
        match remote.command {
            CommandName::Launch => self.handle_launch(remote).await,
            CommandName::Kill => {
                self.handle_kill(&remote.config, signal);
                Ok(())
            }
        }
    }

    async fn handle_launch(&self, remote: RemoteCommand) -> Result<()> {
        let pid_file = self.pid_file(&remote.config);
        fs::write(&pid_file, std::process::id().to_string())?;
        debug!(path = %pid_file.display(), "pid file written");

        let result = self.launch_relay(remote).await;

        if let Err(err) = fs::remove_file(&pid_file) {
            debug!(%err, path = %pid_file.display(), "pid file already gone");
        }
        result
    }

    async fn launch_relay(&self, remote: RemoteCommand) -> Result<()> {
        let settings = LauncherSettings::default().with_timeout(remote.launcher_timeout);
        let mut launcher = Launcher::relay().with_settings(settings);
        if let Some(kind) = remote.observer_kind.as_deref() {
            launcher = launcher.with_events(self.observers.create(kind)?);
        }

        let _listener = launcher.spawn_termination_listener();
        let ids = IdRange {
            id_start: self.params.id,
            group_id_start: self.params.group_id,
            group_count: self.params.group_count,
        };
        launcher
            .run_single(self.params.group_config.clone(), remote.config, ids)
            .await
    }

    fn handle_kill(&self, config: &ProcessConfig, signal: Option<Signal>) {
        let pid_file = self.pid_file(config);
        let Some(pid) = fs::read_to_string(&pid_file)
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
        else {
            debug!(path = %pid_file.display(), "no relay to signal");
            return;
        };

        match signal {
            None => tree::signal_pid(pid, Signal::SIGTERM),
            Some(Signal::SIGKILL) => {
                tree::kill_tree(pid, Signal::SIGKILL);
                // The relay cannot clean up after itself anymore.
                let _ = fs::remove_file(&pid_file);
            }
            Some(other) => tree::signal_pid(pid, other),
        }
    }

    /// Pid file of the relay supervising `config` for these ids.
    ///
    /// The name only depends on the ids, the group and the config, so a
    /// later `kill` command finds the file of the earlier `launch`.
    #[must_use]
    pub fn pid_file(&self, config: &ProcessConfig) -> PathBuf {
        let key = format!(
            "{}-{}-{}-{}",
            self.params.id,
            self.params.group_id,
            self.params.group_config.hash(),
            config.hash()
        );
        std::env::temp_dir().join(format!("procfleet-{}.pid", sha256_hex(&key)))
    }
}
