//! Pipe reader task.
//!
//! Reads newline-delimited output from a worker pipe and forwards every
//! line through an unbounded [`mpsc`] channel, so the supervision loop can
//! poll with `try_recv` and never block on one worker.
//!
//! When every reader of a worker has finished (EOF, I/O error or
//! cancellation) all senders are dropped and the handle observes the
//! channel as disconnected.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::WorkerLineCodec;
use crate::AppError;

/// Forward lines from `pipe` to `line_tx` until EOF or cancellation.
pub async fn run_reader<R>(
    label: &'static str,
    pipe: R,
    line_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(pipe, WorkerLineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(label, "pipe reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(label, "pipe reader: EOF detected");
                        break;
                    }

                    Some(Err(AppError::Protocol(ref msg))) => {
                        // Oversized line: dropped, the stream stays usable.
                        warn!(label, error = msg.as_str(), "pipe reader: framing error, skipping");
                    }

                    Some(Err(err)) => {
                        warn!(label, error = %err, "pipe reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(line)) => {
                        if line_tx.send(line).is_err() {
                            debug!(label, "pipe reader: receiver closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}
