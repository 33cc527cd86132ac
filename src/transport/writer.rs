//! Stdin writer task.
//!
//! Receives outbound JSON values from a tokio [`mpsc`] channel — both data
//! messages from the caller and control envelopes from the protocol engine
//! share one channel, which is what serializes them onto the pipe — and
//! writes each as one `\n`-terminated NDJSON line to the child's stdin.
//!
//! A dedicated `close_stdin` token implements half-close for one-shot
//! sessions: when it fires the task closes the channel, drains any values
//! already queued onto the pipe, then shuts the stdin handle down so the
//! child observes end-of-input after the last queued message. Sends racing
//! the close fail with a closed-channel error at the call site.

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AgentError, Result};

/// Writer task body. Exits when cancelled, when all senders drop, or after
/// `close_stdin` fires, the queue is drained, and the handle is shut down.
///
/// # Errors
///
/// - [`AgentError::Protocol`] if a value fails to serialize (cannot occur
///   for [`Value`], kept for the seam).
/// - [`AgentError::Io`] if a write to stdin fails, e.g. the child exited.
pub async fn run_writer(
    mut stdin: ChildStdin,
    mut msg_rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
    close_stdin: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("conduit writer: cancellation received, stopping");
                break;
            }

            () = close_stdin.cancelled() => {
                debug!("conduit writer: closing stdin for end of input");
                // Refuse new sends, but flush everything already queued —
                // a message sent just before the half-close must still
                // reach the child ahead of the EOF.
                msg_rx.close();
                while let Some(value) = msg_rx.recv().await {
                    write_line(&mut stdin, &value).await?;
                }
                if let Err(e) = stdin.shutdown().await {
                    warn!(error = %e, "conduit writer: stdin shutdown failed");
                }
                break;
            }

            msg = msg_rx.recv() => {
                match msg {
                    None => {
                        debug!("conduit writer: message channel closed, stopping");
                        break;
                    }
                    Some(value) => write_line(&mut stdin, &value).await?,
                }
            }
        }
    }

    Ok(())
}

/// Serialize one value as an NDJSON line and flush it to stdin.
async fn write_line(stdin: &mut ChildStdin, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(value).map_err(|e| {
        AgentError::Protocol(format!("failed to serialize outbound message: {e}"))
    })?;
    bytes.push(b'\n');

    stdin.write_all(&bytes).await.map_err(|e| {
        warn!(error = %e, "conduit writer: write to stdin failed");
        AgentError::Io(format!("write to agent stdin failed: {e}"))
    })?;
    stdin
        .flush()
        .await
        .map_err(|e| AgentError::Io(format!("flush of agent stdin failed: {e}")))
}
