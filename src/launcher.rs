//! Supervision loop.
//!
//! A [`Launcher`] expands group configs into process handles, starts them,
//! and polls every running handle once per tick, applying the timeout,
//! restart, soft-stop and force-kill policy. All handle I/O happens on the
//! task driving [`Launcher::run_master`] or [`Launcher::run_single`]; other
//! tasks (signal listeners, observers) only queue [`ControlCommand`]s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::config::{GroupConfig, LauncherSettings, ProcessConfig};
use crate::logging::{context_of, LogLevel, LogSink, ProcessLogger};
use crate::observer::{notify, LauncherEvents, SharedEvents};
use crate::process::{LauncherContext, ProcessHandle, ProcessStatus, ReadOutcome};
use crate::protocol::Pinger;
use crate::registry::{HandlerRegistry, IdRange};
use crate::signals;
use crate::{AppError, Result};

/// Tick sleep after a round that produced content.
const CONTENT_TICK: Duration = Duration::from_millis(50);
/// Tick sleep after a round that produced content while stopping.
const DRAIN_TICK: Duration = Duration::from_millis(1);
/// Tick sleep after an idle round.
const IDLE_TICK: Duration = Duration::from_millis(100);
/// Granularity of the all-suspended wait.
const WAIT_TICK: Duration = Duration::from_millis(30);
/// Length of one all-suspended wait.
const SUSPENDED_WAIT: Duration = Duration::from_secs(1);

/// Display used for launcher-level log lines.
pub const MASTER_DISPLAY: &str = "master";

// ── Control ──────────────────────────────────────────────────────────────────

/// Request queued for the supervision loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Initiate the graceful stop phase.
    Stop,
    /// Suspend one group: soft-stop its handles, or kill them with `force`.
    SuspendGroup {
        /// Target group.
        name: String,
        /// Kill instead of soft-stopping.
        force: bool,
    },
    /// Resume one group, starting its handles if a run is active.
    ResumeGroup {
        /// Target group.
        name: String,
    },
    /// Suspend every group.
    SuspendAll {
        /// Kill instead of soft-stopping.
        force: bool,
    },
    /// Resume every group.
    ResumeAll,
}

/// Cloneable handle queueing commands for a [`Launcher`].
///
/// Commands are applied once per tick by the loop; sending never blocks
/// and is a no-op once the launcher is gone.
#[derive(Debug, Clone)]
pub struct LauncherControl {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl LauncherControl {
    /// Queue `command`.
    pub fn send(&self, command: ControlCommand) {
        if self.tx.send(command).is_err() {
            debug!("launcher gone, control command dropped");
        }
    }

    /// Request a graceful stop.
    pub fn stop(&self) {
        self.send(ControlCommand::Stop);
    }

    /// Suspend the group called `name`.
    pub fn suspend_group(&self, name: impl Into<String>, force: bool) {
        self.send(ControlCommand::SuspendGroup {
            name: name.into(),
            force,
        });
    }

    /// Resume the group called `name`.
    pub fn resume_group(&self, name: impl Into<String>) {
        self.send(ControlCommand::ResumeGroup { name: name.into() });
    }

    /// Suspend every group.
    pub fn suspend_all(&self, force: bool) {
        self.send(ControlCommand::SuspendAll { force });
    }

    /// Resume every group.
    pub fn resume_all(&self) {
        self.send(ControlCommand::ResumeAll);
    }
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Role of a launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherMode {
    /// Main master: logs locally and honours suspend/resume.
    Master,
    /// Far side of an SSH session: relays logs and pings upstream.
    Relay,
}

#[derive(Debug)]
struct GroupSlot {
    config: Arc<GroupConfig>,
    suspended: bool,
}

/// The supervision engine.
pub struct Launcher {
    mode: LauncherMode,
    settings: LauncherSettings,
    logger: ProcessLogger,
    registry: HandlerRegistry,
    events: Option<SharedEvents>,
    groups: Vec<GroupSlot>,
    handles: BTreeMap<u32, ProcessHandle>,
    must_stop: bool,
    control: LauncherControl,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    pinger: Pinger,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("mode", &self.mode)
            .field("settings", &self.settings)
            .field("groups", &self.groups)
            .field("handles", &self.handles.len())
            .field("must_stop", &self.must_stop)
            .finish_non_exhaustive()
    }
}

impl Launcher {
    fn with_logger(mode: LauncherMode, logger: ProcessLogger) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            mode,
            settings: LauncherSettings::default(),
            logger,
            registry: HandlerRegistry::default(),
            events: None,
            groups: Vec::new(),
            handles: BTreeMap::new(),
            must_stop: false,
            control: LauncherControl { tx },
            commands,
            pinger: Pinger::new(),
        }
    }

    /// Main master logging to `sink`.
    #[must_use]
    pub fn master(sink: Arc<dyn LogSink>) -> Self {
        Self::with_logger(LauncherMode::Master, ProcessLogger::master(sink))
    }

    /// Relay launcher run by a remote bootstrap.
    #[must_use]
    pub fn relay() -> Self {
        Self::with_logger(LauncherMode::Relay, ProcessLogger::relay())
    }

    /// Replace the limits.
    #[must_use]
    pub fn with_settings(mut self, settings: LauncherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach an observer.
    #[must_use]
    pub fn with_events(mut self, events: SharedEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the handler registry.
    #[must_use]
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Role of this launcher.
    #[must_use]
    pub fn mode(&self) -> LauncherMode {
        self.mode
    }

    /// Whether this is the main master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.mode == LauncherMode::Master
    }

    /// Current limits.
    #[must_use]
    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Shared logger.
    #[must_use]
    pub fn logger(&self) -> &ProcessLogger {
        &self.logger
    }

    /// Control handle for this launcher.
    #[must_use]
    pub fn control(&self) -> LauncherControl {
        self.control.clone()
    }

    /// Whether a stop was requested and not yet consumed by a run.
    #[must_use]
    pub fn must_stop(&self) -> bool {
        self.must_stop
    }

    /// Handles of the current run, in spawn order.
    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.handles.values()
    }

    /// Whether any handle is Running or Stopping.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handles.values().any(ProcessHandle::is_running)
    }

    /// Whether the group called `name` is suspended.
    #[must_use]
    pub fn is_group_suspended(&self, name: &str) -> bool {
        self.groups
            .iter()
            .any(|slot| slot.suspended && slot.config.name == name)
    }

    /// Set the groups supervised by [`Launcher::run_master`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a group is invalid or one of its
    /// process configs has no factory or cannot be instantiated.
    pub fn set_groups(&mut self, groups: Vec<GroupConfig>) -> Result<()> {
        for group in &groups {
            self.check_group(group)?;
        }
        self.groups = groups
            .into_iter()
            .map(|config| GroupSlot {
                config: Arc::new(config),
                suspended: false,
            })
            .collect();
        Ok(())
    }

    fn check_group(&self, group: &GroupConfig) -> Result<()> {
        group.validate()?;
        for config in &group.processes {
            self.registry.resolve(config)?.check(config)?;
        }
        Ok(())
    }

    /// Turn SIGTERM and Ctrl-C into [`ControlCommand::Stop`] until the
    /// returned guard is dropped.
    #[must_use]
    pub fn spawn_termination_listener(&self) -> DropGuard {
        let cancel = CancellationToken::new();
        let control = self.control();
        let logger = self.logger.clone();
        signals::spawn_signal_task(cancel.clone(), move || {
            logger.notice(
                "Received SIGTERM, stopping",
                context_of(&[("display", MASTER_DISPLAY)]),
            );
            control.stop();
        });
        cancel.drop_guard()
    }

    // ── Runs ─────────────────────────────────────────────────────────────────

    /// Supervise every group until all processes ended.
    ///
    /// Waits while every group is suspended. With `never_exit`, starts over
    /// after each run until a stop is requested.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no group is set or a handle cannot be
    /// instantiated; already started processes are killed first.
    pub async fn run_master(&mut self, never_exit: bool) -> Result<()> {
        if self.groups.is_empty() {
            return Err(AppError::Config("no group to launch".into()));
        }
        self.must_stop = false;

        'runs: loop {
            while self.all_suspended() {
                self.check().await;
                if !self.wait_suspended().await {
                    break 'runs;
                }
            }

            self.notify_launcher(|events, control| events.starting(control));
            if let Err(err) = self.start_groups().await {
                self.abort_run().await;
                return Err(err);
            }
            self.notify_launcher(|events, control| events.started(control));

            self.supervise().await;
            self.handles.clear();

            if !never_exit || self.must_stop {
                break;
            }
        }

        self.notify_launcher(|events, control| events.stopped(control));
        self.must_stop = false;
        Ok(())
    }

    /// Supervise a single process config: the far-side entry point of a
    /// remote `launch` command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the group or config is invalid.
    pub async fn run_single(
        &mut self,
        group: GroupConfig,
        config: ProcessConfig,
        ids: IdRange,
    ) -> Result<()> {
        self.check_group(&group)?;
        self.registry.resolve(&config)?.check(&config)?;

        let group = Arc::new(group);
        self.groups = vec![GroupSlot {
            config: Arc::clone(&group),
            suspended: false,
        }];

        self.notify_launcher(|events, control| events.starting(control));
        if let Err(err) = self
            .start_group_process(&group, &Arc::new(config), ids)
            .await
        {
            self.abort_run().await;
            return Err(err);
        }
        self.notify_launcher(|events, control| events.started(control));

        self.supervise().await;

        self.notify_launcher(|events, control| events.stopped(control));
        self.handles.clear();
        self.must_stop = false;
        Ok(())
    }

    async fn start_groups(&mut self) -> Result<()> {
        let mut id_start = 1;
        for index in 0..self.groups.len() {
            self.apply_commands().await;
            if self.must_stop {
                break;
            }
            let group = Arc::clone(&self.groups[index].config);
            let group_count = self.registry.count_group(&group)?;
            id_start += self.start_group(&group, id_start, group_count).await?;
        }
        Ok(())
    }

    async fn start_group(
        &mut self,
        group: &Arc<GroupConfig>,
        id_start: u32,
        group_count: u32,
    ) -> Result<u32> {
        let mut ids = IdRange {
            id_start,
            group_id_start: 1,
            group_count,
        };
        let mut started = 0;
        for config in &group.processes {
            let count = self
                .start_group_process(group, &Arc::new(config.clone()), ids)
                .await?;
            ids.id_start += count;
            ids.group_id_start += count;
            started += count;
        }
        Ok(started)
    }

    async fn start_group_process(
        &mut self,
        group: &Arc<GroupConfig>,
        config: &Arc<ProcessConfig>,
        ids: IdRange,
    ) -> Result<u32> {
        let factory = self.registry.resolve(config)?;
        let count = factory.will_start_count(config);
        let handles = factory.instantiate(&self.context(), group, config, ids)?;

        let suspended = self.is_group_suspended(&group.name);
        for mut handle in handles {
            if !suspended {
                handle.start().await;
            }
            self.handles.insert(handle.id(), handle);
        }
        debug!(group = group.name.as_str(), count, suspended, "process config started");
        Ok(count)
    }

    fn context(&self) -> LauncherContext {
        LauncherContext {
            logger: self.logger.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
        }
    }

    // ── Supervision ──────────────────────────────────────────────────────────

    async fn supervise(&mut self) {
        let started = Instant::now();
        let mut last_content = Instant::now();
        let mut stop_started: Option<Instant> = None;
        let mut stop_due = false;

        while self.is_running() {
            let stopping = stop_started.is_some();
            if self.read_children(stopping).await {
                last_content = Instant::now();
                tokio::time::sleep(if stopping { DRAIN_TICK } else { CONTENT_TICK }).await;
            } else {
                tokio::time::sleep(IDLE_TICK).await;
                self.ping();
            }

            self.check().await;

            if let Some(stop_started) = stop_started {
                if stop_started.elapsed() >= self.settings.timeout() {
                    self.log_master(
                        LogLevel::Error,
                        "Timeout waiting for clean shutdown, force kill",
                    );
                    break;
                }
            } else if stop_due || self.must_stop {
                self.log_master(LogLevel::Notice, "Stopping...");
                stop_started = Some(Instant::now());
                for handle in self.handles.values_mut() {
                    if handle.is_running() {
                        handle.soft_stop().await;
                    }
                }
            } else if self
                .settings
                .max_running_time()
                .is_some_and(|limit| started.elapsed() > limit)
            {
                // Takes effect on the next tick.
                stop_due = true;
            } else if last_content.elapsed() > self.settings.timeout() {
                self.log_master(LogLevel::Error, "Timeout waiting for content, force kill");
                break;
            }
        }

        self.kill_remaining().await;
    }

    /// Read every running handle once; returns whether any produced content.
    async fn read_children(&mut self, stopping: bool) -> bool {
        let max_timeouts = self.settings.max_process_timeouts;
        let mut got_content = false;

        for handle in self.handles.values_mut() {
            if !handle.is_running() {
                continue;
            }
            match handle.read().await {
                ReadOutcome::Success => got_content = true,
                ReadOutcome::Empty => {}
                ReadOutcome::Timeout => {
                    if max_timeouts > 0 && handle.timeouts_count() >= max_timeouts {
                        handle.stop(Some(Signal::SIGKILL)).await;
                    } else if stopping {
                        handle.stop(Some(Signal::SIGKILL)).await;
                    } else if handle.restart(Some(Signal::SIGKILL)).await {
                        got_content = true;
                    } else {
                        handle.stop(None).await;
                    }
                }
                ReadOutcome::Failed => handle.stop(None).await,
            }
        }
        got_content
    }

    async fn kill_remaining(&mut self) {
        for handle in self.handles.values_mut() {
            if handle.status() != ProcessStatus::Stopped {
                handle.stop(Some(Signal::SIGKILL)).await;
            }
        }
    }

    async fn abort_run(&mut self) {
        self.kill_remaining().await;
        self.handles.clear();
        self.must_stop = false;
    }

    fn ping(&self) {
        if self.mode == LauncherMode::Relay {
            self.pinger.ping();
        }
    }

    fn all_suspended(&self) -> bool {
        self.groups.iter().all(|slot| slot.suspended)
    }

    /// Sleep for [`SUSPENDED_WAIT`], applying commands; `false` once a stop
    /// was requested.
    async fn wait_suspended(&mut self) -> bool {
        let started = Instant::now();
        while started.elapsed() < SUSPENDED_WAIT {
            self.apply_commands().await;
            if self.must_stop {
                return false;
            }
            tokio::time::sleep(WAIT_TICK).await;
        }
        !self.must_stop
    }

    // ── Control ──────────────────────────────────────────────────────────────

    async fn check(&mut self) {
        let control = &self.control;
        notify(self.events.as_ref(), |events| events.check(control));
        self.apply_commands().await;
    }

    async fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command).await;
        }
    }

    async fn apply(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Stop => self.must_stop = true,
            ControlCommand::SuspendGroup { name, force } => {
                self.suspend(Some(&name), force).await;
            }
            ControlCommand::ResumeGroup { name } => self.resume(Some(&name)).await,
            ControlCommand::SuspendAll { force } => self.suspend(None, force).await,
            ControlCommand::ResumeAll => self.resume(None).await,
        }
    }

    async fn suspend(&mut self, name: Option<&str>, force: bool) {
        if !self.is_master() {
            return;
        }
        info!(group = name.unwrap_or("*"), force, "suspending");
        for slot in &mut self.groups {
            if targets(name, &slot.config.name) {
                slot.suspended = true;
            }
        }
        for handle in self.handles.values_mut() {
            if !targets(name, &handle.group_config().name) {
                continue;
            }
            if force {
                handle.stop(Some(Signal::SIGKILL)).await;
            } else {
                handle.soft_stop().await;
            }
        }
    }

    async fn resume(&mut self, name: Option<&str>) {
        if !self.is_master() {
            return;
        }
        info!(group = name.unwrap_or("*"), "resuming");
        for slot in &mut self.groups {
            if targets(name, &slot.config.name) {
                slot.suspended = false;
            }
        }
        // Outside a run, handles are started by the next run.
        if !self.is_running() {
            return;
        }
        for handle in self.handles.values_mut() {
            if !targets(name, &handle.group_config().name) {
                continue;
            }
            handle.start().await;
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn notify_launcher(&self, callback: impl FnOnce(&mut dyn LauncherEvents, &LauncherControl)) {
        let control = &self.control;
        notify(self.events.as_ref(), |events| callback(events, control));
    }

    fn log_master(&self, level: LogLevel, message: &str) {
        self.logger
            .log(level, message, context_of(&[("display", MASTER_DISPLAY)]));
    }
}

/// Whether a command aimed at `name` (every group when `None`) targets
/// `group`.
fn targets(name: Option<&str>, group: &str) -> bool {
    name.map_or(true, |name| name == group)
}
