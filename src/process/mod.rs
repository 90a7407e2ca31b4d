//! Process handles.
//!
//! A [`ProcessHandle`] is the master-side representation of one supervised
//! worker. It owns the status machine and the liveness clocks; everything
//! that depends on where the worker runs lives behind the [`Transport`]
//! trait ([`local::LocalTransport`], [`remote::RemoteTransport`]).

pub mod local;
pub mod reader;
pub mod remote;
pub mod tree;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde_json::Value;

use crate::config::{GroupConfig, LauncherSettings, ProcessConfig, DEFAULT_PROCESS_TIMEOUT_SECONDS};
use crate::logging::{LogContext, LogLevel, ProcessLogger};
use crate::observer::{notify, ProcessInfo, SharedEvents};
use crate::protocol::params::LaunchParams;
use crate::protocol::{classify, WorkerLine};

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Status ───────────────────────────────────────────────────────────────────

/// Lifecycle status of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not started, or stopped.
    Stopped,
    /// Started and supervised.
    Running,
    /// A graceful stop was requested; the worker has not exited yet.
    Stopping,
    /// The last start failed.
    Error,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Result of one [`ProcessHandle::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A line was consumed.
    Success,
    /// Nothing to read yet.
    Empty,
    /// The worker is gone, ended, or was killed.
    Failed,
    /// No line for longer than the read timeout.
    Timeout,
}

/// Result of a non-blocking line read on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// One line, terminator stripped.
    Line(String),
    /// No data available; the stream is still open.
    Empty,
    /// The stream is closed and the worker is gone.
    Closed,
}

// ── Launch context ───────────────────────────────────────────────────────────

/// Launcher-wide state shared with every handle.
#[derive(Clone)]
pub struct LauncherContext {
    /// Logger of the owning launcher.
    pub logger: ProcessLogger,
    /// Observer of the owning launcher.
    pub events: Option<SharedEvents>,
    /// Limits of the owning launcher.
    pub settings: LauncherSettings,
}

impl std::fmt::Debug for LauncherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherContext")
            .field("logger", &self.logger)
            .field("events", &self.events.is_some())
            .field("settings", &self.settings)
            .finish()
    }
}

impl LauncherContext {
    /// Kind tag of the observer, if any.
    #[must_use]
    pub fn observer_kind(&self) -> Option<String> {
        let events = self.events.as_ref()?;
        let guard = events.lock().ok()?;
        guard.kind().map(str::to_owned)
    }
}

/// Everything a transport needs to know about the worker it launches.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Run-unique id.
    pub id: u32,
    /// Group-relative id.
    pub group_id: u32,
    /// Number of processes in the group.
    pub group_count: u32,
    /// Owning group.
    pub group: Arc<GroupConfig>,
    /// Process config the handle was instantiated from.
    pub config: Arc<ProcessConfig>,
    /// Launcher-wide state.
    pub launcher: LauncherContext,
}

impl LaunchSpec {
    /// `<command>/<id>/<group_id>`.
    #[must_use]
    pub fn display(&self) -> String {
        format!("{}/{}/{}", self.group.command, self.id, self.group_id)
    }

    /// Read timeout in seconds: process override, then group, then
    /// [`DEFAULT_PROCESS_TIMEOUT_SECONDS`]. `0` disables it.
    #[must_use]
    pub fn timeout_seconds(&self) -> u64 {
        self.config
            .overrides()
            .timeout_seconds
            .or(self.group.defaults.timeout_seconds)
            .unwrap_or(DEFAULT_PROCESS_TIMEOUT_SECONDS)
    }

    /// Binary to run: process override, then group, then the running
    /// executable.
    #[must_use]
    pub fn bin_path(&self) -> PathBuf {
        self.config
            .overrides()
            .bin_path
            .clone()
            .or_else(|| self.group.defaults.bin_path.clone())
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(&self.group.command))
    }

    /// Working directory: process override, then group, then the current
    /// directory.
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.config
            .overrides()
            .path
            .clone()
            .or_else(|| self.group.defaults.path.clone())
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Niceness to apply, if any.
    #[must_use]
    pub fn priority(&self) -> Option<i32> {
        self.config
            .overrides()
            .priority
            .or(self.group.defaults.priority)
            .filter(|priority| *priority != 0)
    }

    /// Parameters every invocation carries.
    #[must_use]
    pub fn launch_params(&self) -> LaunchParams {
        LaunchParams::new(
            self.id,
            self.group_id,
            self.group_count,
            GroupConfig::clone(&self.group),
        )
    }
}

/// Logger bound to one handle's context keys.
#[derive(Debug, Clone)]
pub struct HandleLogger {
    logger: ProcessLogger,
    context: LogContext,
}

impl HandleLogger {
    /// Bind `logger` to `group`, `host` and, when given, `display`.
    #[must_use]
    pub fn new(logger: ProcessLogger, group: &str, host: &str, display: Option<&str>) -> Self {
        let mut context = LogContext::new();
        if let Some(display) = display {
            context.insert("display".to_owned(), Value::String(display.to_owned()));
        }
        context.insert("host".to_owned(), Value::String(host.to_owned()));
        context.insert("group".to_owned(), Value::String(group.to_owned()));
        Self { logger, context }
    }

    /// Log one message with the bound context.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.logger.log(level, message, self.context.clone());
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// Where and how a worker runs.
pub trait Transport: Send {
    /// Host the worker runs on.
    fn host(&self) -> &str;

    /// Whether the handle reports its lifecycle to the observer. Remote
    /// handles leave that to the far side.
    fn reports_events(&self) -> bool {
        true
    }

    /// Whether log lines carry the handle's display identifier.
    fn logs_display(&self) -> bool {
        true
    }

    /// Extra seconds added to a non-zero read timeout.
    fn timeout_margin(&self) -> u64 {
        0
    }

    /// Create the underlying OS resource. Returns `false` on failure, after
    /// logging why through `log`.
    fn launch<'a>(&'a mut self, spec: &'a LaunchSpec, log: &'a HandleLogger)
        -> BoxFuture<'a, bool>;

    /// Deliver `signal` to the worker.
    fn send_signal<'a>(
        &'a mut self,
        spec: &'a LaunchSpec,
        log: &'a HandleLogger,
        signal: Signal,
    ) -> BoxFuture<'a, ()>;

    /// Release pipes, streams and sessions. Must be idempotent.
    fn release(&mut self);

    /// Read one line without blocking.
    fn read_line(&mut self) -> LineRead;
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// One supervised worker.
pub struct ProcessHandle {
    spec: LaunchSpec,
    transport: Box<dyn Transport>,
    log: HandleLogger,
    status: ProcessStatus,
    last_seen: Option<Instant>,
    last_seen_timeout: Instant,
    stopping_at: Option<Instant>,
    timeouts_count: u32,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("display", &self.spec.display())
            .field("host", &self.transport.host())
            .field("status", &self.status)
            .field("timeouts_count", &self.timeouts_count)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Wrap `transport` into a stopped handle.
    #[must_use]
    pub fn new(spec: LaunchSpec, transport: Box<dyn Transport>) -> Self {
        let display = spec.display();
        let log = HandleLogger::new(
            spec.launcher.logger.clone(),
            &spec.group.name,
            transport.host(),
            transport.logs_display().then_some(display.as_str()),
        );
        let handle = Self {
            spec,
            transport,
            log,
            status: ProcessStatus::Stopped,
            last_seen: None,
            last_seen_timeout: Instant::now(),
            stopping_at: None,
            timeouts_count: 0,
        };
        handle.emit(|events, info| events.process_created(info));
        handle
    }

    /// Run-unique id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.spec.id
    }

    /// Group-relative id.
    #[must_use]
    pub fn group_id(&self) -> u32 {
        self.spec.group_id
    }

    /// Number of processes in the group.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        self.spec.group_count
    }

    /// Owning group.
    #[must_use]
    pub fn group_config(&self) -> &GroupConfig {
        &self.spec.group
    }

    /// Host the worker runs on.
    #[must_use]
    pub fn host(&self) -> &str {
        self.transport.host()
    }

    /// `<command>/<id>/<group_id>`.
    #[must_use]
    pub fn display(&self) -> String {
        self.spec.display()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Consecutive read timeouts since the last line.
    #[must_use]
    pub fn timeouts_count(&self) -> u32 {
        self.timeouts_count
    }

    /// When the last line was read.
    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Whether the handle is Running or Stopping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.status, ProcessStatus::Running | ProcessStatus::Stopping)
    }

    /// Effective read timeout, `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self.spec.timeout_seconds() {
            0 => None,
            seconds => Some(Duration::from_secs(
                seconds.saturating_add(self.transport.timeout_margin()),
            )),
        }
    }

    /// Snapshot for observers.
    #[must_use]
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.spec.id,
            group_id: self.spec.group_id,
            group_count: self.spec.group_count,
            group_name: self.spec.group.name.clone(),
            display: self.spec.display(),
            host: self.transport.host().to_owned(),
            status: self.status,
            timeouts_count: self.timeouts_count,
        }
    }

    /// Start the worker.
    ///
    /// A Stopping handle is force-killed first; a Running handle is left
    /// alone. Returns `false` and moves to Error when the launch fails.
    pub async fn start(&mut self) -> bool {
        if self.status == ProcessStatus::Stopping {
            self.stop(Some(Signal::SIGKILL)).await;
        } else if self.is_running() {
            return true;
        }

        if !self.transport.launch(&self.spec, &self.log).await {
            self.transport.release();
            self.status = ProcessStatus::Error;
            return false;
        }

        let now = Instant::now();
        self.stopping_at = None;
        self.last_seen = Some(now);
        self.last_seen_timeout = now;
        self.status = ProcessStatus::Running;
        self.emit(|events, info| events.process_started(info));
        true
    }

    /// Stop the worker, optionally delivering `signal` first.
    ///
    /// Safe to call repeatedly: resources are released once, and `Ended` is
    /// logged only on the transition to Stopped.
    pub async fn stop(&mut self, signal: Option<Signal>) {
        if self.is_running() {
            if let Some(signal) = signal {
                self.transport
                    .send_signal(&self.spec, &self.log, signal)
                    .await;
            }
            self.transport.release();
        }

        if self.status != ProcessStatus::Stopped {
            self.status = ProcessStatus::Stopped;
            self.log.log(LogLevel::Notice, "Ended");
            self.emit(|events, info| events.process_stopped(info));
        }
    }

    /// Ask a running worker to exit on its own.
    pub async fn soft_stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.transport
            .send_signal(&self.spec, &self.log, Signal::SIGTERM)
            .await;
        self.status = ProcessStatus::Stopping;
        self.stopping_at = Some(Instant::now());
    }

    /// Stop then start again; returns the start outcome.
    pub async fn restart(&mut self, signal: Option<Signal>) -> bool {
        self.stop(signal).await;
        self.start().await
    }

    /// Poll the worker for one line.
    pub async fn read(&mut self) -> ReadOutcome {
        if !self.is_running() {
            return ReadOutcome::Failed;
        }

        if self.status == ProcessStatus::Stopping {
            if let (Some(timeout), Some(stopping_at)) = (self.timeout(), self.stopping_at) {
                if stopping_at.elapsed() >= timeout {
                    self.log
                        .log(LogLevel::Error, "Timeout reached while waiting for soft stop...");
                    self.stop(Some(Signal::SIGKILL)).await;
                    return ReadOutcome::Failed;
                }
            }
        }

        match self.transport.read_line() {
            LineRead::Line(line) if !line.trim().is_empty() => self.consume(&line),
            LineRead::Line(_) | LineRead::Empty => self.check_timeout(),
            LineRead::Closed => ReadOutcome::Failed,
        }
    }

    fn consume(&mut self, line: &str) -> ReadOutcome {
        let now = Instant::now();
        self.timeouts_count = 0;
        self.last_seen = Some(now);
        self.last_seen_timeout = now;
        self.emit(|events, info| events.process_was_seen(info, line));

        match classify(line) {
            WorkerLine::Ended => ReadOutcome::Failed,
            WorkerLine::Ping => ReadOutcome::Success,
            WorkerLine::Log(text) => {
                self.log.log(LogLevel::Info, text);
                ReadOutcome::Success
            }
        }
    }

    fn check_timeout(&mut self) -> ReadOutcome {
        let Some(timeout) = self.timeout() else {
            return ReadOutcome::Empty;
        };
        if self.last_seen_timeout.elapsed() < timeout {
            return ReadOutcome::Empty;
        }

        self.timeouts_count += 1;
        self.last_seen_timeout = Instant::now();
        self.log
            .log(LogLevel::Error, "Timeout reached while waiting for data...");
        self.emit(|events, info| events.process_timedout(info));
        ReadOutcome::Timeout
    }

    fn emit(&self, f: impl FnOnce(&mut dyn crate::observer::LauncherEvents, &ProcessInfo)) {
        if !self.transport.reports_events() || self.spec.launcher.events.is_none() {
            return;
        }
        let info = self.info();
        notify(self.spec.launcher.events.as_ref(), |events| f(events, &info));
    }
}
