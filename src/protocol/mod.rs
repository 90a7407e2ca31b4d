//! Worker stdout protocol.
//!
//! A worker's stdout carries three kinds of lines:
//!
//! | Line                             | Meaning                               |
//! |----------------------------------|---------------------------------------|
//! | [`PING_SENTINEL`]                | liveness only, never logged           |
//! | [`ENDED_SENTINEL`]               | the worker is about to exit cleanly   |
//! | [`ENVELOPE_PREFIX`]`{json}`      | relayed `(level, message, context)`   |
//! | *(anything else)*                | free text, logged at `info`           |
//!
//! Sentinels are compared for full-string equality once the trailing
//! newline is stripped; leading or trailing spaces make a line plain text.

pub mod codec;
pub mod params;

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::{LogContext, LogLevel};

/// Liveness sentinel.
pub const PING_SENTINEL: &str = "procfleet::ping";

/// End-of-work sentinel, written once right before a worker exits.
pub const ENDED_SENTINEL: &str = "procfleet::ended";

/// Literal prefix of a relayed log envelope.
pub const ENVELOPE_PREFIX: &str = "procfleet::log:";

/// Minimum interval between two pings sent by the same process.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// A log record serialized onto a worker's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEnvelope {
    /// Severity of the record.
    pub level: LogLevel,
    /// Message text, possibly itself an envelope.
    pub message: String,
    /// Structured context accumulated so far.
    #[serde(default)]
    pub context: LogContext,
}

/// Serialize an envelope into a single protocol line (without newline).
#[must_use]
pub fn encode_envelope(envelope: &LogEnvelope) -> String {
    // Serializing a struct of strings and a JSON map cannot fail.
    let body = serde_json::to_string(envelope).unwrap_or_default();
    format!("{ENVELOPE_PREFIX}{body}")
}

/// Decode an envelope line.
///
/// Returns `None` when the line lacks the prefix or its body fails to
/// decode; such lines are then handled as plain text.
#[must_use]
pub fn decode_envelope(line: &str) -> Option<LogEnvelope> {
    let body = line.strip_prefix(ENVELOPE_PREFIX)?;
    match serde_json::from_str(body) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            debug!(%err, "malformed log envelope, treating as plain text");
            None
        }
    }
}

/// Classification of one line read from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLine<'a> {
    /// [`PING_SENTINEL`].
    Ping,
    /// [`ENDED_SENTINEL`].
    Ended,
    /// Anything else: plain text or an envelope, both handed to the logger.
    Log(&'a str),
}

/// Strip the line terminator (`\n`, `\r\n`) and nothing else.
#[must_use]
pub fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Classify a raw line.
#[must_use]
pub fn classify(line: &str) -> WorkerLine<'_> {
    let line = strip_terminator(line);
    if line == PING_SENTINEL {
        WorkerLine::Ping
    } else if line == ENDED_SENTINEL {
        WorkerLine::Ended
    } else {
        WorkerLine::Log(line)
    }
}

/// Write one line to stdout and flush it.
///
/// Errors are ignored: a worker whose parent is gone has nobody to tell.
pub fn emit_line(line: &str) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Rate-limited ping writer.
#[derive(Debug, Default)]
pub struct Pinger {
    last_sent: Mutex<Option<Instant>>,
}

impl Pinger {
    /// Create a pinger that has never pinged.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a ping is due now; records the send when it is.
    pub fn due(&self) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last_sent {
            Some(previous) if now.duration_since(previous) < PING_INTERVAL => false,
            _ => {
                *last_sent = Some(now);
                true
            }
        }
    }

    /// Write [`PING_SENTINEL`] to stdout unless one was written during the
    /// last [`PING_INTERVAL`].
    pub fn ping(&self) {
        if self.due() {
            emit_line(PING_SENTINEL);
        }
    }
}

/// Write [`ENDED_SENTINEL`] to stdout.
pub fn send_ended() {
    emit_line(ENDED_SENTINEL);
}
