//! SSH transport.
//!
//! A remote handle runs the bootstrap on another host with a `launch`
//! command; the bootstrap supervises the nested local workers and relays
//! their output, so the SSH channel carries the same protocol lines a local
//! worker would write. Signals travel over a second, short-lived session
//! running the bootstrap with a `kill` command.
//!
//! `ssh2` is blocking: session setup, the channel pump and the kill drain
//! all run on `spawn_blocking` threads.

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nix::sys::signal::Signal;
use nix::unistd::{getuid, User};
use ssh2::{Channel, Session};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxFuture, HandleLogger, LaunchSpec, LineRead, Transport};
use crate::config::RemoteConfig;
use crate::logging::LogLevel;
use crate::protocol::codec::WorkerLineCodec;
use crate::protocol::params::{CommandName, RemoteCommand, LAUNCHER_KIND};
use crate::{AppError, Result};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Attempts for each of connect, authenticate and exec.
pub const SSH_ATTEMPTS: u32 = 5;

/// Pause between two attempts.
pub const SSH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// TCP connect and handshake timeout.
pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds added to the read timeout of remote handles, so the far-side
/// launcher gets to restart its nested workers first.
pub const REMOTE_TIMEOUT_MARGIN_SECONDS: u64 = 30;

/// Kill drain timeout used when the read timeout is disabled.
const DEFAULT_KILL_DRAIN: Duration = Duration::from_secs(30);

const PUMP_IDLE: Duration = Duration::from_millis(30);
const DRAIN_IDLE: Duration = Duration::from_millis(300);
const CHUNK_BYTES: usize = 8192;

/// Resolved SSH destination and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host as configured, used in logs.
    pub label: String,
    /// Host name or address to connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// SSH user.
    pub username: String,
    /// Private key; the public key is `<private_key>.pub`.
    pub private_key: PathBuf,
}

impl SshTarget {
    /// Resolve `host` (`host` or `host:port`) and the credentials of
    /// `config`, defaulting to the current user and `~/.ssh/id_rsa`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the current user cannot be resolved
    /// or either key file is unreadable.
    pub fn resolve(host: &str, config: &RemoteConfig) -> Result<Self> {
        let (address, port) = split_host_port(host);

        let current = if config.username.is_none() || config.private_key.is_none() {
            Some(current_user()?)
        } else {
            None
        };

        let username = match (&config.username, &current) {
            (Some(username), _) => username.clone(),
            (None, Some(user)) => user.name.clone(),
            (None, None) => return Err(AppError::Config("cannot resolve SSH user".into())),
        };
        let private_key = match (&config.private_key, &current) {
            (Some(key), _) => key.clone(),
            (None, Some(user)) => user.dir.join(".ssh").join("id_rsa"),
            (None, None) => return Err(AppError::Config("cannot resolve SSH key".into())),
        };

        ensure_readable(&private_key, "private")?;
        ensure_readable(&public_key_of(&private_key), "public")?;

        Ok(Self {
            label: host.to_owned(),
            host: address,
            port,
            username,
            private_key,
        })
    }

    /// Path of the public key.
    #[must_use]
    pub fn public_key(&self) -> PathBuf {
        public_key_of(&self.private_key)
    }
}

/// Split `host:port`; a missing or unparsable port means [`DEFAULT_SSH_PORT`].
#[must_use]
pub fn split_host_port(host: &str) -> (String, u16) {
    if let Some((address, port)) = host.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (address.to_owned(), port);
        }
    }
    (host.to_owned(), DEFAULT_SSH_PORT)
}

fn current_user() -> Result<User> {
    User::from_uid(getuid())
        .map_err(|err| AppError::Config(format!("cannot resolve current user: {err}")))?
        .ok_or_else(|| AppError::Config("current user has no passwd entry".into()))
}

fn public_key_of(private_key: &Path) -> PathBuf {
    let mut raw = private_key.as_os_str().to_owned();
    raw.push(".pub");
    PathBuf::from(raw)
}

fn ensure_readable(path: &Path, which: &str) -> Result<()> {
    std::fs::File::open(path).map(drop).map_err(|err| {
        AppError::Config(format!(
            "failed to read SSH {which} key file {}: {err}",
            path.display()
        ))
    })
}

/// Live launch session.
struct Pumped {
    lines: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

/// Worker launched over SSH.
pub struct RemoteTransport {
    target: SshTarget,
    pumped: Option<Pumped>,
}

impl std::fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("target", &self.target)
            .field("connected", &self.pumped.is_some())
            .finish()
    }
}

impl RemoteTransport {
    /// Transport for `target`, not connected yet.
    #[must_use]
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            pumped: None,
        }
    }

    /// Bootstrap command line for `command`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the parameters fail to serialize.
    pub fn command_line(
        spec: &LaunchSpec,
        command: CommandName,
        signal: Option<Signal>,
    ) -> Result<String> {
        let remote = RemoteCommand {
            command,
            signal: signal.map(|signal| signal as i32),
            config: spec.config.to_local(),
            launcher_kind: LAUNCHER_KIND.to_owned(),
            launcher_timeout: spec.launcher.settings.remote_timeout_seconds(),
            observer_kind: spec.launcher.observer_kind(),
        };
        spec.launch_params()
            .with_remote(remote)
            .shell_command(&spec.work_dir(), &spec.bin_path())
    }

    fn kill_drain_timeout(spec: &LaunchSpec) -> Duration {
        match spec.timeout_seconds() {
            0 => DEFAULT_KILL_DRAIN,
            seconds => Duration::from_secs(seconds.saturating_add(REMOTE_TIMEOUT_MARGIN_SECONDS)),
        }
    }
}

impl Transport for RemoteTransport {
    fn host(&self) -> &str {
        &self.target.label
    }

    fn reports_events(&self) -> bool {
        false
    }

    fn logs_display(&self) -> bool {
        false
    }

    fn timeout_margin(&self) -> u64 {
        REMOTE_TIMEOUT_MARGIN_SECONDS
    }

    fn launch<'a>(
        &'a mut self,
        spec: &'a LaunchSpec,
        log: &'a HandleLogger,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let cmd = match Self::command_line(spec, CommandName::Launch, None) {
                Ok(cmd) => cmd,
                Err(err) => {
                    log.log(LogLevel::Error, &format!("Failed to start: {err}"));
                    return false;
                }
            };

            let target = self.target.clone();
            let exec_log = log.clone();
            let opened =
                tokio::task::spawn_blocking(move || remote_exec(&target, &cmd, &exec_log)).await;
            let Ok(Some((session, channel))) = opened else {
                return false;
            };

            let (line_tx, lines) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let pump_cancel = cancel.clone();
            tokio::task::spawn_blocking(move || pump(&session, channel, &line_tx, &pump_cancel));
            self.pumped = Some(Pumped { lines, cancel });
            true
        })
    }

    fn send_signal<'a>(
        &'a mut self,
        spec: &'a LaunchSpec,
        log: &'a HandleLogger,
        signal: Signal,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let cmd = match Self::command_line(spec, CommandName::Kill, Some(signal)) {
                Ok(cmd) => cmd,
                Err(err) => {
                    warn!(%err, "cannot build remote kill command");
                    return;
                }
            };
            let target = self.target.clone();
            let drain_log = log.clone();
            let timeout = Self::kill_drain_timeout(spec);
            let outcome = tokio::task::spawn_blocking(move || {
                if let Some((session, channel)) = remote_exec(&target, &cmd, &drain_log) {
                    drain(&session, channel, &drain_log, timeout);
                }
            })
            .await;
            if let Err(err) = outcome {
                warn!(%err, "remote kill task failed");
            }
        })
    }

    fn release(&mut self) {
        if let Some(pumped) = self.pumped.take() {
            pumped.cancel.cancel();
        }
    }

    fn read_line(&mut self) -> LineRead {
        let Some(pumped) = self.pumped.as_mut() else {
            return LineRead::Closed;
        };
        match pumped.lines.try_recv() {
            Ok(line) => LineRead::Line(line),
            Err(TryRecvError::Empty) => LineRead::Empty,
            Err(TryRecvError::Disconnected) => LineRead::Closed,
        }
    }
}

// ── Blocking SSH helpers ─────────────────────────────────────────────────────

fn retry<T>(step: &str, mut attempt: impl FnMut() -> Result<T>) -> Option<T> {
    for round in 1..=SSH_ATTEMPTS {
        match attempt() {
            Ok(value) => return Some(value),
            Err(err) => {
                debug!(step, round, %err, "ssh attempt failed");
                thread::sleep(SSH_RETRY_DELAY);
            }
        }
    }
    None
}

fn connect(target: &SshTarget) -> Result<Session> {
    let addresses = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| AppError::Transport(format!("cannot resolve {}: {err}", target.host)))?;

    let mut last_error = AppError::Transport(format!("no address for {}", target.host));
    for address in addresses {
        match TcpStream::connect_timeout(&address, SSH_CONNECT_TIMEOUT) {
            Ok(stream) => {
                let mut session = Session::new().map_err(ssh_error)?;
                session.set_tcp_stream(stream);
                session.set_timeout(timeout_millis(SSH_CONNECT_TIMEOUT));
                session.handshake().map_err(ssh_error)?;
                return Ok(session);
            }
            Err(err) => last_error = AppError::Transport(format!("connect {address}: {err}")),
        }
    }
    Err(last_error)
}

fn authenticate(session: &Session, target: &SshTarget) -> Result<()> {
    session
        .userauth_pubkey_file(
            &target.username,
            Some(target.public_key().as_path()),
            &target.private_key,
            None,
        )
        .map_err(ssh_error)?;
    if session.authenticated() {
        Ok(())
    } else {
        Err(AppError::Transport("authentication rejected".into()))
    }
}

fn exec(session: &Session, cmd: &str) -> Result<Channel> {
    let mut channel = session.channel_session().map_err(ssh_error)?;
    channel.exec(&format!("{cmd}; exit")).map_err(ssh_error)?;
    Ok(channel)
}

/// Connect, authenticate and execute `cmd`, each step retried.
fn remote_exec(target: &SshTarget, cmd: &str, log: &HandleLogger) -> Option<(Session, Channel)> {
    let Some(session) = retry("connect", || connect(target)) else {
        log.log(LogLevel::Error, "SSH connection failed");
        return None;
    };
    log.log(LogLevel::Debug, "Connected to host");

    if retry("authenticate", || authenticate(&session, target)).is_none() {
        log.log(
            LogLevel::Error,
            &format!(
                "Authentication failed using {} and {}",
                target.username,
                target.private_key.display()
            ),
        );
        disconnect(&session);
        return None;
    }

    // Launched workers run for hours: no blocking-call timeout past setup.
    session.set_timeout(0);
    let Some(channel) = retry("exec", || exec(&session, cmd)) else {
        log.log(LogLevel::Error, &format!("Exec failed for {cmd}"));
        disconnect(&session);
        return None;
    };
    Some((session, channel))
}

/// Forward channel lines to `line_tx` until EOF or cancellation.
fn pump(
    session: &Session,
    mut channel: Channel,
    line_tx: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) {
    session.set_blocking(false);
    let mut codec = WorkerLineCodec::new();
    let mut buffer = BytesMut::with_capacity(CHUNK_BYTES);
    let mut chunk = [0_u8; CHUNK_BYTES];

    while !cancel.is_cancelled() {
        match channel.read(&mut chunk) {
            Ok(0) if channel.eof() => {
                forward_remaining(&mut codec, &mut buffer, line_tx);
                break;
            }
            Ok(0) => thread::sleep(PUMP_IDLE),
            Ok(read) => {
                buffer.extend_from_slice(&chunk[..read]);
                if !forward_lines(&mut codec, &mut buffer, line_tx) {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if channel.eof() {
                    forward_remaining(&mut codec, &mut buffer, line_tx);
                    break;
                }
                thread::sleep(PUMP_IDLE);
            }
            Err(err) => {
                warn!(%err, "ssh channel read failed");
                break;
            }
        }
    }
    debug!("ssh pump finished");
    disconnect(session);
}

fn forward_lines(
    codec: &mut WorkerLineCodec,
    buffer: &mut BytesMut,
    line_tx: &mpsc::UnboundedSender<String>,
) -> bool {
    loop {
        match codec.decode(buffer) {
            Ok(Some(line)) => {
                if line_tx.send(line).is_err() {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(err) => warn!(%err, "ssh channel: framing error, skipping"),
        }
    }
}

fn forward_remaining(
    codec: &mut WorkerLineCodec,
    buffer: &mut BytesMut,
    line_tx: &mpsc::UnboundedSender<String>,
) {
    if forward_lines(codec, buffer, line_tx) {
        if let Ok(Some(line)) = codec.decode_eof(buffer) {
            let _ = line_tx.send(line);
        }
    }
}

/// Log kill-session output at debug level until EOF or `timeout`.
fn drain(session: &Session, mut channel: Channel, log: &HandleLogger, timeout: Duration) {
    session.set_blocking(false);
    let started = Instant::now();
    let mut codec = WorkerLineCodec::new();
    let mut buffer = BytesMut::with_capacity(CHUNK_BYTES);
    let mut chunk = [0_u8; CHUNK_BYTES];

    while !channel.eof() && started.elapsed() < timeout {
        match channel.read(&mut chunk) {
            Ok(read) if read > 0 => {
                buffer.extend_from_slice(&chunk[..read]);
                while let Ok(Some(line)) = codec.decode(&mut buffer) {
                    if !line.trim().is_empty() {
                        log.log(LogLevel::Debug, &line);
                    }
                }
            }
            Ok(_) => thread::sleep(DRAIN_IDLE),
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(DRAIN_IDLE),
            Err(err) => {
                debug!(%err, "kill session read failed");
                break;
            }
        }
    }
    disconnect(session);
}

fn disconnect(session: &Session) {
    session.set_blocking(true);
    session.set_timeout(timeout_millis(SSH_CONNECT_TIMEOUT));
    if let Err(err) = session.disconnect(None, "procfleet done", None) {
        debug!(%err, "ssh disconnect failed");
    }
}

fn ssh_error(err: ssh2::Error) -> AppError {
    AppError::Transport(err.to_string())
}

fn timeout_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
