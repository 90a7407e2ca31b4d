//! Inter-process logging.
//!
//! Every log record is a `(level, message, context)` triple. On the master
//! the [`ProcessLogger`] unwraps relayed envelopes, prefixes the message with
//! `[group] [host] [display]` and hands it to a [`LogSink`]. On a relay (the
//! far side of an SSH session) it serializes the record as an envelope line
//! on stdout, where the upstream master picks it up.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Level;

use crate::protocol::{self, LogEnvelope};

/// Structured context attached to a log record.
pub type LogContext = Map<String, Value>;

/// Context keys rendered as a message prefix, in order.
const PREFIX_KEYS: [&str; 3] = ["group", "host", "display"];

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Detailed diagnostics.
    Debug,
    /// Ordinary worker output.
    Info,
    /// Lifecycle notices (`Ended`, `Stopping...`).
    Notice,
    /// Recoverable anomalies.
    Warning,
    /// Timeouts and transport failures.
    Error,
    /// Critical conditions.
    Critical,
    /// Action required.
    Alert,
    /// System unusable.
    Emergency,
}

impl LogLevel {
    /// Lowercase level name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Alert => "alert",
            Self::Emergency => "emergency",
        }
    }

    /// Closest `tracing` level.
    #[must_use]
    pub fn tracing_level(self) -> Level {
        match self {
            Self::Debug => Level::DEBUG,
            Self::Info | Self::Notice => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical | Self::Alert | Self::Emergency => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final destination of master-side log records.
pub trait LogSink: Send + Sync {
    /// Record one message. `message` already carries its prefix.
    fn log(&self, level: LogLevel, message: &str, context: &LogContext);
}

/// Sink forwarding records to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str, context: &LogContext) {
        let severity = level.as_str();
        if context.is_empty() {
            match level.tracing_level() {
                Level::DEBUG => tracing::debug!(severity, "{message}"),
                Level::INFO => tracing::info!(severity, "{message}"),
                Level::WARN => tracing::warn!(severity, "{message}"),
                _ => tracing::error!(severity, "{message}"),
            }
            return;
        }

        let context = Value::Object(context.clone());
        match level.tracing_level() {
            Level::DEBUG => tracing::debug!(severity, %context, "{message}"),
            Level::INFO => tracing::info!(severity, %context, "{message}"),
            Level::WARN => tracing::warn!(severity, %context, "{message}"),
            _ => tracing::error!(severity, %context, "{message}"),
        }
    }
}

#[derive(Clone)]
enum Route {
    Sink(Arc<dyn LogSink>),
    Relay,
}

/// Logger shared by a launcher and all of its process handles.
#[derive(Clone)]
pub struct ProcessLogger {
    route: Route,
}

impl std::fmt::Debug for ProcessLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let route = match self.route {
            Route::Sink(_) => "sink",
            Route::Relay => "relay",
        };
        f.debug_struct("ProcessLogger").field("route", &route).finish()
    }
}

impl ProcessLogger {
    /// Logger of the main master, writing to `sink`.
    #[must_use]
    pub fn master(sink: Arc<dyn LogSink>) -> Self {
        Self {
            route: Route::Sink(sink),
        }
    }

    /// Logger of a relay process, writing envelopes to stdout.
    #[must_use]
    pub fn relay() -> Self {
        Self { route: Route::Relay }
    }

    /// Whether records end up in a local sink.
    #[must_use]
    pub fn is_master(&self) -> bool {
        matches!(self.route, Route::Sink(_))
    }

    /// Log one record.
    pub fn log(&self, level: LogLevel, message: &str, context: LogContext) {
        match &self.route {
            Route::Relay => {
                let envelope = LogEnvelope {
                    level,
                    message: message.to_owned(),
                    context,
                };
                protocol::emit_line(&protocol::encode_envelope(&envelope));
            }
            Route::Sink(sink) => {
                if let Some(envelope) = protocol::decode_envelope(message) {
                    let merged = merge_context(context, envelope.context);
                    self.log(envelope.level, &envelope.message, merged);
                    return;
                }
                let (message, rest) = prefix_message(message, context);
                sink.log(level, &message, &rest);
            }
        }
    }

    /// Log at debug level.
    pub fn debug(&self, message: &str, context: LogContext) {
        self.log(LogLevel::Debug, message, context);
    }

    /// Log at info level.
    pub fn info(&self, message: &str, context: LogContext) {
        self.log(LogLevel::Info, message, context);
    }

    /// Log at notice level.
    pub fn notice(&self, message: &str, context: LogContext) {
        self.log(LogLevel::Notice, message, context);
    }

    /// Log at error level.
    pub fn error(&self, message: &str, context: LogContext) {
        self.log(LogLevel::Error, message, context);
    }

    /// Log at emergency level.
    pub fn emergency(&self, message: &str, context: LogContext) {
        self.log(LogLevel::Emergency, message, context);
    }
}

/// Merge the context of a relayed envelope into the context of the hop that
/// received it.
///
/// Inner keys win, except `host`: the receiving hop knows which host the
/// line actually came from and always sets it last.
#[must_use]
pub fn merge_context(outer: LogContext, inner: LogContext) -> LogContext {
    let host = outer.get("host").cloned();
    let mut merged = outer;
    merged.extend(inner);
    if let Some(host) = host {
        merged.insert("host".to_owned(), host);
    }
    merged
}

/// Build a context from string pairs.
#[must_use]
pub fn context_of(pairs: &[(&str, &str)]) -> LogContext {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), Value::String((*value).to_owned())))
        .collect()
}

fn prefix_message(message: &str, mut context: LogContext) -> (String, LogContext) {
    let mut parts = Vec::with_capacity(PREFIX_KEYS.len() + 1);
    for key in PREFIX_KEYS {
        if let Some(value) = context.remove(key) {
            match value {
                Value::String(text) => parts.push(format!("[{text}]")),
                other => parts.push(format!("[{other}]")),
            }
        }
    }
    parts.push(message.to_owned());
    (parts.join(" ").trim().to_owned(), context)
}
