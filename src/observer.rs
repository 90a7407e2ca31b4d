//! Lifecycle observer surface.
//!
//! A [`LauncherEvents`] implementation is notified of launcher and process
//! lifecycle changes. Every callback is fire-and-forget; only
//! [`LauncherEvents::check`] may influence the run, by queueing commands on
//! the [`LauncherControl`] it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::launcher::LauncherControl;
use crate::process::ProcessStatus;
use crate::{AppError, Result};

/// Point-in-time description of a process handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Run-unique id.
    pub id: u32,
    /// Group-relative id.
    pub group_id: u32,
    /// Number of processes in the group.
    pub group_count: u32,
    /// Name of the owning group.
    pub group_name: String,
    /// `<command>/<id>/<group_id>`.
    pub display: String,
    /// Host the process runs on.
    pub host: String,
    /// Status at the time of the snapshot.
    pub status: ProcessStatus,
    /// Consecutive read timeouts.
    pub timeouts_count: u32,
}

/// Launcher lifecycle callbacks. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait LauncherEvents: Send {
    /// Kind tag forwarded to remote bootstraps so they can instantiate the
    /// same observer on the far side.
    fn kind(&self) -> Option<&str> {
        None
    }

    /// The launcher is about to start its processes.
    fn starting(&mut self, control: &LauncherControl) {}

    /// All processes were started.
    fn started(&mut self, control: &LauncherControl) {}

    /// Called once per supervision tick, and once per second while every
    /// group is suspended.
    fn check(&mut self, control: &LauncherControl) {}

    /// The launcher finished.
    fn stopped(&mut self, control: &LauncherControl) {}

    /// A process handle was instantiated.
    fn process_created(&mut self, process: &ProcessInfo) {}

    /// A process was started.
    fn process_started(&mut self, process: &ProcessInfo) {}

    /// A process read timed out.
    fn process_timedout(&mut self, process: &ProcessInfo) {}

    /// A process was stopped.
    fn process_stopped(&mut self, process: &ProcessInfo) {}

    /// A process produced a line.
    fn process_was_seen(&mut self, process: &ProcessInfo, line: &str) {}
}

/// Observer shared between a launcher and its process handles.
pub type SharedEvents = Arc<Mutex<dyn LauncherEvents>>;

/// Run `f` against the observer, if any. A poisoned observer is skipped.
pub(crate) fn notify(events: Option<&SharedEvents>, f: impl FnOnce(&mut dyn LauncherEvents)) {
    if let Some(events) = events {
        if let Ok(mut guard) = events.lock() {
            f(&mut *guard);
        }
    }
}

type ObserverFactory = Box<dyn Fn() -> SharedEvents + Send + Sync>;

/// Observer constructors keyed by [`LauncherEvents::kind`], used by the
/// bootstrap to rebuild the master's observer on a remote host.
#[derive(Default)]
pub struct ObserverRegistry {
    factories: HashMap<String, ObserverFactory>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObserverRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `kind` is already registered.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> SharedEvents + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(AppError::Config(format!(
                "observer kind already registered: {kind}"
            )));
        }
        self.factories.insert(kind, Box::new(factory));
        Ok(())
    }

    /// Build the observer registered for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unknown kind.
    pub fn create(&self, kind: &str) -> Result<SharedEvents> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| AppError::Config(format!("unknown observer kind: {kind}")))
    }
}
