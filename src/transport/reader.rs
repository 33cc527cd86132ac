//! Line demultiplexer — the stdout reader task.
//!
//! Reads newline-delimited JSON from the child's stdout, peeks each line's
//! `type` tag, and routes it: the three control envelope kinds go to the
//! protocol engine and never reach the caller; everything else passes
//! through the conversational-parse seam onto the bounded data channel in
//! stream order, so the caller's view of data messages has no gaps and no
//! control artifacts.
//!
//! On a stream-level read failure, and when EOF reveals a child that died
//! with a non-zero exit code, the engine is notified *first* — pending
//! control requests fail immediately instead of waiting out their own
//! timeouts — and only then is the failure surfaced downstream.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{is_control_type, ControlMessage, ProtocolEngine};
use crate::transport::codec::LineCodec;
use crate::{AgentError, Result};

/// Bound on how long the reader waits for the child to exit after its
/// stdout reaches EOF before giving up on exit-code reporting.
const EXIT_REPORT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Conversational-parse seam: maps one raw JSON value from the stream into
/// zero or more messages for the caller. The typed message hierarchy is an
/// external collaborator; the default parser forwards values verbatim.
pub trait MessageParser: Send + Sync {
    /// Map a raw data-message value into caller-visible messages.
    ///
    /// # Errors
    ///
    /// Implementations surface malformed messages as errors; the reader
    /// forwards them downstream without stopping.
    fn parse(&self, raw: Value) -> Result<Vec<Value>>;
}

/// Default parser: each data line is one message, verbatim.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineParser;

impl MessageParser for JsonLineParser {
    fn parse(&self, raw: Value) -> Result<Vec<Value>> {
        Ok(vec![raw])
    }
}

/// Reader task body: demultiplex `stdout` until EOF, stream failure, or
/// cancellation.
///
/// Generic over the stream so tests can drive it with an in-memory duplex.
/// `child` is consulted only after a clean EOF, to report a non-zero exit
/// code downstream.
pub async fn run_reader<R>(
    stdout: R,
    engine: Arc<ProtocolEngine>,
    parser: Arc<dyn MessageParser>,
    message_tx: mpsc::Sender<Result<Value>>,
    child: Arc<Mutex<Option<Child>>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, LineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("conduit reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("conduit reader: EOF on agent stdout");
                        report_exit(&child, &engine, &message_tx).await;
                        break;
                    }

                    Some(Err(AgentError::Protocol(ref msg))) => {
                        // Oversized line — skip it, the stream itself is fine.
                        warn!(error = msg.as_str(), "conduit reader: framing error, skipping");
                    }

                    Some(Err(err)) => {
                        warn!(error = %err, "conduit reader: stream error, stopping");
                        // Pending requests first, downstream second.
                        engine.fail_pending(&err).await;
                        let _ = message_tx.send(Err(err)).await;
                        break;
                    }

                    Some(Ok(line)) => {
                        if handle_line(&engine, parser.as_ref(), &message_tx, &line).await.is_err() {
                            debug!("conduit reader: message channel closed, stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Route one line. Returns `Err(())` only when the downstream channel is
/// closed and the reader should stop.
async fn handle_line(
    engine: &Arc<ProtocolEngine>,
    parser: &dyn MessageParser,
    message_tx: &mpsc::Sender<Result<Value>>,
    line: &str,
) -> std::result::Result<(), ()> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(());
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "conduit reader: malformed JSON line");
            let err = AgentError::Protocol(format!("malformed json line: {e}"));
            return message_tx.send(Err(err)).await.map_err(|_| ());
        }
    };

    let type_tag = value.get("type").and_then(Value::as_str).unwrap_or("");
    if is_control_type(type_tag) {
        match serde_json::from_value::<ControlMessage>(value) {
            Ok(message) => engine.handle_control_message(message).await,
            Err(e) => {
                warn!(error = %e, "conduit reader: malformed control envelope, skipping");
            }
        }
        return Ok(());
    }

    match parser.parse(value) {
        Ok(messages) => {
            for message in messages {
                message_tx.send(Ok(message)).await.map_err(|_| ())?;
            }
        }
        Err(err) => {
            message_tx.send(Err(err)).await.map_err(|_| ())?;
        }
    }
    Ok(())
}

/// After a clean EOF, report a non-zero exit code downstream. A zero exit
/// is not an error; a child that does not exit within the bound is left to
/// the transport's termination path.
///
/// Pending control requests fail first, same ordering as a stream error:
/// a dead child can never answer them, so they must not sit out their own
/// timeouts.
async fn report_exit(
    child: &Arc<Mutex<Option<Child>>>,
    engine: &Arc<ProtocolEngine>,
    message_tx: &mpsc::Sender<Result<Value>>,
) {
    let mut guard = child.lock().await;
    let Some(child) = guard.as_mut() else {
        return;
    };

    match tokio::time::timeout(EXIT_REPORT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            if let Some(code) = status.code() {
                if code != 0 {
                    let err = AgentError::Process(format!(
                        "agent process failed with exit code: {code} — check stderr output for details"
                    ));
                    engine.fail_pending(&err).await;
                    let _ = message_tx.send(Err(err)).await;
                }
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "conduit reader: failed to reap agent process");
        }
        Err(_) => {
            debug!("conduit reader: agent still running after stdout EOF");
        }
    }
}
