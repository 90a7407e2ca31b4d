//! Shared fixtures for unit tests.
//!
//! Provides an in-memory log sink, a scripted [`Transport`] and a recording
//! observer so handle and launcher tests can run without spawning anything.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use procfleet::config::{GroupConfig, LauncherSettings, ProcessConfig};
use procfleet::launcher::LauncherControl;
use procfleet::logging::{LogContext, LogLevel, LogSink, ProcessLogger};
use procfleet::observer::{LauncherEvents, ProcessInfo, SharedEvents};
use procfleet::process::{
    BoxFuture, HandleLogger, LaunchSpec, LauncherContext, LineRead, ProcessHandle, Transport,
};

// ── Log sink ─────────────────────────────────────────────────────────────────

/// Sink keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(LogLevel, String, LogContext)>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records as `"level - message"`, in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(level, message, _)| format!("{level} - {message}"))
            .collect()
    }

    pub fn records(&self) -> Vec<(LogLevel, String, LogContext)> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.lines().iter().filter(|seen| *seen == line).count()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str, context: &LogContext) {
        self.records
            .lock()
            .unwrap()
            .push((level, message.to_owned(), context.clone()));
    }
}

// ── Scripted transport ───────────────────────────────────────────────────────

/// Shared view of what a [`ScriptedTransport`] was asked to do.
#[derive(Debug, Default)]
pub struct Script {
    pub lines: VecDeque<LineRead>,
    pub signals: Vec<Signal>,
    pub launches: u32,
    pub releases: u32,
    pub fail_launch: bool,
}

/// Transport replaying queued lines; `Empty` once the queue is drained.
pub struct ScriptedTransport {
    pub script: Arc<Mutex<Script>>,
    pub reports_events: bool,
}

impl ScriptedTransport {
    pub fn new() -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script::default()));
        (
            Self {
                script: Arc::clone(&script),
                reports_events: true,
            },
            script,
        )
    }
}

impl Transport for ScriptedTransport {
    fn host(&self) -> &str {
        "fake"
    }

    fn reports_events(&self) -> bool {
        self.reports_events
    }

    fn launch<'a>(
        &'a mut self,
        _spec: &'a LaunchSpec,
        log: &'a HandleLogger,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut script = self.script.lock().unwrap();
            script.launches += 1;
            if script.fail_launch {
                log.log(LogLevel::Error, "Failed to start: scripted");
                return false;
            }
            true
        })
    }

    fn send_signal<'a>(
        &'a mut self,
        _spec: &'a LaunchSpec,
        _log: &'a HandleLogger,
        signal: Signal,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.script.lock().unwrap().signals.push(signal);
        })
    }

    fn release(&mut self) {
        self.script.lock().unwrap().releases += 1;
    }

    fn read_line(&mut self) -> LineRead {
        self.script
            .lock()
            .unwrap()
            .lines
            .pop_front()
            .unwrap_or(LineRead::Empty)
    }
}

// ── Recording observer ───────────────────────────────────────────────────────

/// Observer recording callbacks as short strings.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Vec<String>,
}

impl LauncherEvents for Recorder {
    fn starting(&mut self, _control: &LauncherControl) {
        self.events.push("starting".into());
    }

    fn started(&mut self, _control: &LauncherControl) {
        self.events.push("started".into());
    }

    fn stopped(&mut self, _control: &LauncherControl) {
        self.events.push("stopped".into());
    }

    fn process_created(&mut self, process: &ProcessInfo) {
        self.events.push(format!("created {}", process.id));
    }

    fn process_started(&mut self, process: &ProcessInfo) {
        self.events.push(format!("started {}", process.id));
    }

    fn process_timedout(&mut self, process: &ProcessInfo) {
        self.events
            .push(format!("timedout {} {}", process.id, process.timeouts_count));
    }

    fn process_stopped(&mut self, process: &ProcessInfo) {
        self.events.push(format!("stopped {}", process.id));
    }

    fn process_was_seen(&mut self, process: &ProcessInfo, line: &str) {
        self.events.push(format!("seen {} {line}", process.id));
    }
}

pub fn recorder() -> (Arc<Mutex<Recorder>>, SharedEvents) {
    let recorder = Arc::new(Mutex::new(Recorder::default()));
    let shared: SharedEvents = recorder.clone();
    (recorder, shared)
}

// ── Handles ──────────────────────────────────────────────────────────────────

pub fn spec(
    sink: Arc<MemorySink>,
    events: Option<SharedEvents>,
    group: GroupConfig,
    config: ProcessConfig,
) -> LaunchSpec {
    LaunchSpec {
        id: 1,
        group_id: 1,
        group_count: 1,
        group: Arc::new(group),
        config: Arc::new(config),
        launcher: LauncherContext {
            logger: ProcessLogger::master(sink),
            events,
            settings: LauncherSettings::default(),
        },
    }
}

/// A stopped handle over a scripted transport, in group `g` running `cmd`.
pub fn scripted_handle(
    sink: Arc<MemorySink>,
    events: Option<SharedEvents>,
    timeout_seconds: u64,
) -> (ProcessHandle, Arc<Mutex<Script>>) {
    let (transport, script) = ScriptedTransport::new();
    let group = GroupConfig::new("g", "cmd").with_timeout(timeout_seconds);
    let handle = ProcessHandle::new(
        spec(sink, events, group, ProcessConfig::local(1)),
        Box::new(transport),
    );
    (handle, script)
}

pub fn push_line(script: &Arc<Mutex<Script>>, line: &str) {
    script
        .lock()
        .unwrap()
        .lines
        .push_back(LineRead::Line(line.to_owned()));
}
