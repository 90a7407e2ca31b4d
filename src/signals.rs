//! Termination signal plumbing.
//!
//! Registering a listener replaces the default SIGTERM disposition for the
//! whole process: from then on SIGTERM only requests a cooperative stop.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Spawn a task running `on_signal` for every SIGTERM or Ctrl-C received
/// until `cancel` fires.
///
/// The SIGTERM handler is installed before this function returns.
pub fn spawn_signal_task<F>(cancel: CancellationToken, mut on_signal: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => Some(sigterm),
        Err(err) => {
            warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
            None
        }
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                () = next_sigterm(&mut sigterm) => on_signal(),
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        warn!(%err, "ctrl-c handler failed");
                        break;
                    }
                    on_signal();
                }
            }
        }
    })
}

async fn next_sigterm(sigterm: &mut Option<Signal>) {
    let Some(stream) = sigterm else {
        return std::future::pending().await;
    };
    if stream.recv().await.is_none() {
        *sigterm = None;
        std::future::pending::<()>().await;
    }
}
