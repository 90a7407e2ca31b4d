//! Worker invocation parameters.
//!
//! A worker is launched as `<bin_path> <command> <json>`, where `<json>` is
//! a shell-quoted [`LaunchParams`] object. When the invocation targets the
//! remote bootstrap rather than a worker task, [`LaunchParams::remote`]
//! carries the control command to execute.

use std::path::Path;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::config::{GroupConfig, ProcessConfig};
use crate::{AppError, Result};

/// Kind tag of the only group config shape on the wire.
pub const GROUP_CONFIG_KIND: &str = "group";

/// Kind tag of the launcher the bootstrap instantiates on the far side.
pub const LAUNCHER_KIND: &str = "standard";

/// Control command understood by the bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandName {
    /// Run a relay launcher supervising the nested local processes.
    Launch,
    /// Signal the relay launcher started by a previous `launch`.
    Kill,
}

/// Master-issued control command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// What to do.
    pub command: CommandName,
    /// Signal number for `kill`; absent means SIGTERM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Process config to run on the far side, tagged by its `kind`.
    pub config: ProcessConfig,
    /// Launcher kind to instantiate.
    pub launcher_kind: String,
    /// Global timeout of the far-side launcher, in seconds.
    pub launcher_timeout: u64,
    /// Observer kind to instantiate, if the master has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observer_kind: Option<String>,
}

impl RemoteCommand {
    /// Decode the signal to deliver.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` for an unknown signal number.
    pub fn signal(&self) -> Result<Option<Signal>> {
        self.signal
            .map(|number| {
                Signal::try_from(number)
                    .map_err(|err| AppError::Protocol(format!("invalid signal {number}: {err}")))
            })
            .transpose()
    }
}

/// Parameters handed to every worker and bootstrap invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchParams {
    /// Run-unique process id.
    pub id: u32,
    /// Group-relative process id.
    pub group_id: u32,
    /// Number of processes in the group.
    pub group_count: u32,
    /// Group the process belongs to.
    pub group_config: GroupConfig,
    /// Kind tag of `group_config`.
    pub group_config_kind: String,
    /// Control command, present only for bootstrap invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteCommand>,
}

impl LaunchParams {
    /// Parameters for a worker task.
    #[must_use]
    pub fn new(id: u32, group_id: u32, group_count: u32, group_config: GroupConfig) -> Self {
        Self {
            id,
            group_id,
            group_count,
            group_config,
            group_config_kind: GROUP_CONFIG_KIND.to_owned(),
            remote: None,
        }
    }

    /// Attach a control command.
    #[must_use]
    pub fn with_remote(mut self, remote: RemoteCommand) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Parse and validate parameters received on the command line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the JSON is malformed, a required
    /// field is missing or zero, or a kind tag is unknown.
    pub fn from_json(raw: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("invalid worker params: {err}")))?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("id", self.id),
            ("group_id", self.group_id),
            ("group_count", self.group_count),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("expected {name} in params")));
            }
        }
        if self.group_config_kind != GROUP_CONFIG_KIND {
            return Err(AppError::Config(format!(
                "unknown group config kind: {}",
                self.group_config_kind
            )));
        }
        self.group_config.validate()?;
        if let Some(remote) = &self.remote {
            if remote.launcher_kind != LAUNCHER_KIND {
                return Err(AppError::Config(format!(
                    "unknown launcher kind: {}",
                    remote.launcher_kind
                )));
            }
            remote.config.validate()?;
        }
        Ok(())
    }

    /// Serialize to the JSON argument.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Argument vector `<bin> <command> <json>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    pub fn argv(&self, bin_path: &Path) -> Result<Vec<String>> {
        Ok(vec![
            bin_path.to_string_lossy().into_owned(),
            self.group_config.command.clone(),
            self.to_json()?,
        ])
    }

    /// Shell command line `cd`-ing into `path` and running the invocation,
    /// with stderr merged into stdout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    pub fn shell_command(&self, path: &Path, bin_path: &Path) -> Result<String> {
        let argv = self.argv(bin_path)?;
        Ok(format!(
            "(cd {} && {}) 2>&1",
            shell_words::quote(&path.to_string_lossy()),
            shell_words::join(argv)
        ))
    }
}
