//! Static process handler registry.
//!
//! Maps a [`ProcessKind`] to the [`ProcessFactory`] that counts and builds
//! handles for configs of that kind.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{GroupConfig, ProcessConfig, ProcessKind};
use crate::process::local::LocalTransport;
use crate::process::remote::{RemoteTransport, SshTarget};
use crate::process::{LaunchSpec, LauncherContext, ProcessHandle};
use crate::{AppError, Result};

/// Id range and group size of a batch of handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    /// First run-unique id.
    pub id_start: u32,
    /// First group-relative id.
    pub group_id_start: u32,
    /// Number of processes in the group.
    pub group_count: u32,
}

/// Builds the handles of one process kind.
pub trait ProcessFactory: Send + Sync {
    /// Kind of configs this factory handles.
    fn kind(&self) -> ProcessKind;

    /// Number of workers `config` will run; ids are reserved for each.
    fn will_start_count(&self, config: &ProcessConfig) -> u32;

    /// Check that handles can be built for `config`, before anything runs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when they cannot.
    fn check(&self, config: &ProcessConfig) -> Result<()> {
        config.validate()
    }

    /// Build the handles of `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `config` is of another kind or cannot
    /// produce handles.
    fn instantiate(
        &self,
        launcher: &LauncherContext,
        group: &Arc<GroupConfig>,
        config: &Arc<ProcessConfig>,
        ids: IdRange,
    ) -> Result<Vec<ProcessHandle>>;
}

fn spec(
    launcher: &LauncherContext,
    group: &Arc<GroupConfig>,
    config: &Arc<ProcessConfig>,
    id: u32,
    group_id: u32,
    group_count: u32,
) -> LaunchSpec {
    LaunchSpec {
        id,
        group_id,
        group_count,
        group: Arc::clone(group),
        config: Arc::clone(config),
        launcher: launcher.clone(),
    }
}

fn wrong_kind(expected: ProcessKind, config: &ProcessConfig) -> AppError {
    AppError::Config(format!(
        "{expected} factory cannot handle a {} process config",
        config.kind()
    ))
}

/// One handle per instance, on the master's host.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFactory;

impl ProcessFactory for LocalFactory {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Local
    }

    fn will_start_count(&self, config: &ProcessConfig) -> u32 {
        config.instances_count()
    }

    fn instantiate(
        &self,
        launcher: &LauncherContext,
        group: &Arc<GroupConfig>,
        config: &Arc<ProcessConfig>,
        ids: IdRange,
    ) -> Result<Vec<ProcessHandle>> {
        if config.kind() != ProcessKind::Local {
            return Err(wrong_kind(self.kind(), config));
        }
        Ok((0..config.instances_count())
            .map(|offset| {
                ProcessHandle::new(
                    spec(
                        launcher,
                        group,
                        config,
                        ids.id_start + offset,
                        ids.group_id_start + offset,
                        ids.group_count,
                    ),
                    Box::new(LocalTransport::new()),
                )
            })
            .collect())
    }
}

/// One handle per host; each fans out `instances_count` workers remotely.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteFactory;

impl ProcessFactory for RemoteFactory {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Remote
    }

    fn will_start_count(&self, config: &ProcessConfig) -> u32 {
        match config {
            ProcessConfig::Remote(remote) => {
                let hosts = u32::try_from(remote.hosts.len()).unwrap_or(u32::MAX);
                hosts.saturating_mul(remote.base.instances_count)
            }
            ProcessConfig::Local(_) => 0,
        }
    }

    fn check(&self, config: &ProcessConfig) -> Result<()> {
        config.validate()?;
        let ProcessConfig::Remote(remote) = config else {
            return Err(wrong_kind(self.kind(), config));
        };
        for host in &remote.hosts {
            SshTarget::resolve(host, remote)?;
        }
        Ok(())
    }

    fn instantiate(
        &self,
        launcher: &LauncherContext,
        group: &Arc<GroupConfig>,
        config: &Arc<ProcessConfig>,
        ids: IdRange,
    ) -> Result<Vec<ProcessHandle>> {
        let ProcessConfig::Remote(remote) = config.as_ref() else {
            return Err(wrong_kind(self.kind(), config));
        };

        let stride = remote.base.instances_count;
        let mut handles = Vec::with_capacity(remote.hosts.len());
        let (mut id, mut group_id) = (ids.id_start, ids.group_id_start);
        for host in &remote.hosts {
            let target = SshTarget::resolve(host, remote)?;
            handles.push(ProcessHandle::new(
                spec(launcher, group, config, id, group_id, ids.group_count),
                Box::new(RemoteTransport::new(target)),
            ));
            id += stride;
            group_id += stride;
        }
        Ok(handles)
    }
}

/// Factories keyed by process kind.
pub struct HandlerRegistry {
    factories: HashMap<ProcessKind, Box<dyn ProcessFactory>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut factories: HashMap<ProcessKind, Box<dyn ProcessFactory>> = HashMap::new();
        factories.insert(ProcessKind::Local, Box::new(LocalFactory));
        factories.insert(ProcessKind::Remote, Box::new(RemoteFactory));
        Self { factories }
    }
}

impl HandlerRegistry {
    /// Registry without any factory.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` for its kind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the kind already has a factory.
    pub fn register(&mut self, factory: Box<dyn ProcessFactory>) -> Result<()> {
        let kind = factory.kind();
        if self.factories.contains_key(&kind) {
            return Err(AppError::Config(format!(
                "process kind already registered: {kind}"
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Factory for `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no factory handles its kind.
    pub fn resolve(&self, config: &ProcessConfig) -> Result<&dyn ProcessFactory> {
        self.factories
            .get(&config.kind())
            .map(|factory| &**factory)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "process kind {} is not handled by any factory",
                    config.kind()
                ))
            })
    }

    /// Number of workers a group will run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unhandled process kind.
    pub fn count_group(&self, group: &GroupConfig) -> Result<u32> {
        group.processes.iter().try_fold(0_u32, |total, config| {
            Ok(total.saturating_add(self.resolve(config)?.will_start_count(config)))
        })
    }
}
