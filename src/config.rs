//! Group and process configuration value objects, launcher settings, and
//! the fleet file loader used by the `procfleet` binary.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::{AppError, Result};

/// Read timeout applied to a process when neither its own config nor its
/// group sets one.
pub const DEFAULT_PROCESS_TIMEOUT_SECONDS: u64 = 30;

/// Default global timeout of a launcher.
pub const DEFAULT_LAUNCHER_TIMEOUT_SECONDS: u64 = 300;

/// Smallest non-zero global timeout a launcher accepts.
pub const MIN_LAUNCHER_TIMEOUT_SECONDS: u64 = 5;

/// Default number of consecutive read timeouts before a process is killed.
pub const DEFAULT_MAX_PROCESS_TIMEOUTS: u32 = 3;

pub(crate) fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Settings shared by group and process configs.
///
/// On a process config every field is an override: `None` means "inherit
/// from the group, else a hard default".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConfigOverrides {
    /// Binary executed for the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_path: Option<PathBuf>,
    /// Working directory of the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Niceness applied after spawn (-20 to 19).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Seconds without output before a read times out; `0` disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ConfigOverrides {
    /// Stable hash of the settings that identify a deployment location.
    #[must_use]
    pub fn hash(&self) -> String {
        match &self.path {
            Some(path) => sha256_hex(&path.to_string_lossy()),
            None => String::new(),
        }
    }
}

/// A named set of process configs sharing a command and default settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GroupConfig {
    /// Unique name used to target the group for suspend/resume.
    pub name: String,
    /// Command (task identifier) passed as the first worker argument.
    pub command: String,
    /// Opaque payload forwarded to every worker of the group.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Group-level defaults.
    #[serde(flatten)]
    pub defaults: ConfigOverrides,
    /// Process configs; never part of the wire envelope.
    #[serde(default, skip_serializing)]
    pub processes: Vec<ProcessConfig>,
}

impl GroupConfig {
    /// Create a group with no process configs.
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            params: Map::new(),
            defaults: ConfigOverrides::default(),
            processes: Vec::new(),
        }
    }

    /// Replace the worker params.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Set a single worker param.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the group's default read timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.defaults.timeout_seconds = Some(seconds);
        self
    }

    /// Set the group's default binary.
    #[must_use]
    pub fn with_bin_path(mut self, bin_path: impl Into<PathBuf>) -> Self {
        self.defaults.bin_path = Some(bin_path.into());
        self
    }

    /// Append a process config.
    #[must_use]
    pub fn with_process(mut self, process: ProcessConfig) -> Self {
        self.processes.push(process);
        self
    }

    /// Hash identifying the group, used to derive worker pid files.
    #[must_use]
    pub fn hash(&self) -> String {
        let mut raw = format!("{}-{}-{}", self.defaults.hash(), self.name, self.command);
        if !self.params.is_empty() {
            raw.push('-');
            raw.push_str(&Value::Object(self.params.clone()).to_string());
        }
        sha256_hex(&raw)
    }

    /// Validate the group and all of its process configs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on a missing name or command, or when a
    /// process config is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("group name must not be empty".into()));
        }
        if self.command.trim().is_empty() {
            return Err(AppError::Config(format!(
                "missing command for group {}",
                self.name
            )));
        }
        for process in &self.processes {
            process.validate()?;
        }
        Ok(())
    }
}

fn default_instances_count() -> u32 {
    1
}

/// Fields shared by every process config variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessBase {
    /// Number of worker instances to launch (per host for remote configs).
    #[serde(default = "default_instances_count")]
    pub instances_count: u32,
    /// Per-process overrides of the group defaults.
    #[serde(flatten)]
    pub overrides: ConfigOverrides,
}

impl Default for ProcessBase {
    fn default() -> Self {
        Self {
            instances_count: default_instances_count(),
            overrides: ConfigOverrides::default(),
        }
    }
}

/// Config for workers spawned on the master's own host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LocalConfig {
    /// Shared process fields.
    #[serde(flatten)]
    pub base: ProcessBase,
}

/// Config for workers launched on other hosts over SSH.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Shared process fields.
    #[serde(flatten)]
    pub base: ProcessBase,
    /// Target hosts, `host` or `host:port`.
    pub hosts: Vec<String>,
    /// SSH user; defaults to the current OS user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Private key; defaults to `~/.ssh/id_rsa`. `<key>.pub` must exist too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PathBuf>,
}

/// Kind tag selecting the process handler for a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// [`LocalConfig`].
    Local,
    /// [`RemoteConfig`].
    Remote,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// A process config, tagged by its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessConfig {
    /// Local subprocesses.
    Local(LocalConfig),
    /// SSH-launched processes.
    Remote(RemoteConfig),
}

impl ProcessConfig {
    /// A local config running `instances_count` workers.
    #[must_use]
    pub fn local(instances_count: u32) -> Self {
        Self::Local(LocalConfig {
            base: ProcessBase {
                instances_count,
                overrides: ConfigOverrides::default(),
            },
        })
    }

    /// A remote config running one worker per host.
    #[must_use]
    pub fn remote(hosts: Vec<String>) -> Self {
        Self::Remote(RemoteConfig {
            base: ProcessBase::default(),
            hosts,
            username: None,
            private_key: None,
        })
    }

    /// Kind tag of this config.
    #[must_use]
    pub fn kind(&self) -> ProcessKind {
        match self {
            Self::Local(_) => ProcessKind::Local,
            Self::Remote(_) => ProcessKind::Remote,
        }
    }

    /// Shared process fields.
    #[must_use]
    pub fn base(&self) -> &ProcessBase {
        match self {
            Self::Local(config) => &config.base,
            Self::Remote(config) => &config.base,
        }
    }

    /// Mutable shared process fields.
    pub fn base_mut(&mut self) -> &mut ProcessBase {
        match self {
            Self::Local(config) => &mut config.base,
            Self::Remote(config) => &mut config.base,
        }
    }

    /// Per-process overrides.
    #[must_use]
    pub fn overrides(&self) -> &ConfigOverrides {
        &self.base().overrides
    }

    /// Number of instances per config (per host for remote configs).
    #[must_use]
    pub fn instances_count(&self) -> u32 {
        self.base().instances_count
    }

    /// Set the number of instances.
    #[must_use]
    pub fn with_instances_count(mut self, instances_count: u32) -> Self {
        self.base_mut().instances_count = instances_count;
        self
    }

    /// Set the read timeout override.
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.base_mut().overrides.timeout_seconds = Some(seconds);
        self
    }

    /// Hash identifying the process config, used to derive worker pid files.
    #[must_use]
    pub fn hash(&self) -> String {
        self.overrides().hash()
    }

    /// The local config a remote bootstrap runs on the far host.
    #[must_use]
    pub fn to_local(&self) -> Self {
        Self::Local(LocalConfig {
            base: self.base().clone(),
        })
    }

    /// Validate the config.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an empty instance count or an empty
    /// remote host list.
    pub fn validate(&self) -> Result<()> {
        if self.instances_count() == 0 {
            return Err(AppError::Config(
                "instances_count must be greater than zero".into(),
            ));
        }
        if let Self::Remote(remote) = self {
            if remote.hosts.is_empty() {
                return Err(AppError::Config(
                    "remote process config must list at least one host".into(),
                ));
            }
        }
        Ok(())
    }
}

fn default_launcher_timeout() -> u64 {
    DEFAULT_LAUNCHER_TIMEOUT_SECONDS
}

fn default_max_process_timeouts() -> u32 {
    DEFAULT_MAX_PROCESS_TIMEOUTS
}

/// Limits applied by a launcher's supervision loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherSettings {
    /// Global content and clean-shutdown timeout, never below
    /// [`MIN_LAUNCHER_TIMEOUT_SECONDS`] so a stop phase always ends.
    #[serde(default = "default_launcher_timeout")]
    pub timeout_seconds: u64,
    /// Stop everything once this much time has passed; `0` means unlimited.
    #[serde(default)]
    pub max_running_time_seconds: u64,
    /// Consecutive read timeouts before a process is force-killed; `0`
    /// means unlimited.
    #[serde(default = "default_max_process_timeouts")]
    pub max_process_timeouts: u32,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_LAUNCHER_TIMEOUT_SECONDS,
            max_running_time_seconds: 0,
            max_process_timeouts: DEFAULT_MAX_PROCESS_TIMEOUTS,
        }
    }
}

impl LauncherSettings {
    /// Set the global timeout, raised to [`MIN_LAUNCHER_TIMEOUT_SECONDS`]
    /// when smaller (`0` included).
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = clamp_timeout(seconds);
        self
    }

    /// Set the maximum running time.
    #[must_use]
    pub fn with_max_running_time(mut self, seconds: u64) -> Self {
        self.max_running_time_seconds = seconds;
        self
    }

    /// Set the per-process timeout cap.
    #[must_use]
    pub fn with_max_process_timeouts(mut self, count: u32) -> Self {
        self.max_process_timeouts = count;
        self
    }

    /// Global timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(clamp_timeout(self.timeout_seconds))
    }

    /// Maximum running time, `None` when unlimited.
    #[must_use]
    pub fn max_running_time(&self) -> Option<Duration> {
        (self.max_running_time_seconds > 0)
            .then(|| Duration::from_secs(self.max_running_time_seconds))
    }

    /// Timeout handed to a remote launcher so it gives up before this one.
    #[must_use]
    pub fn remote_timeout_seconds(&self) -> u64 {
        self.timeout_seconds.saturating_sub(2)
    }
}

fn clamp_timeout(seconds: u64) -> u64 {
    seconds.max(MIN_LAUNCHER_TIMEOUT_SECONDS)
}

/// Fleet description parsed from the master's TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FleetConfig {
    /// Launcher limits.
    #[serde(default)]
    pub launcher: LauncherSettings,
    /// Groups to supervise, in launch order.
    pub groups: Vec<GroupConfig>,
}

impl FleetConfig {
    /// Load and validate a fleet file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a fleet description from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(AppError::Config("at least one group is required".into()));
        }

        let mut names = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if group.processes.is_empty() {
                return Err(AppError::Config(format!(
                    "group {} has no process configs",
                    group.name
                )));
            }
            if !names.insert(group.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate group name: {}",
                    group.name
                )));
            }
        }

        self.launcher.timeout_seconds = clamp_timeout(self.launcher.timeout_seconds);
        Ok(())
    }
}
