//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering all supervision failure modes.
///
/// Liveness problems (read timeouts, content timeouts, clean-shutdown
/// timeouts) are not errors: they are reported through
/// [`ReadOutcome::Timeout`](crate::process::ReadOutcome::Timeout) and
/// handled by launcher policy.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure. Never retried.
    Config(String),
    /// SSH connect, authentication or exec failure after all retries.
    Transport(String),
    /// Malformed worker parameters or inter-process envelope.
    Protocol(String),
    /// OS process spawn or signal delivery failure.
    Process(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
