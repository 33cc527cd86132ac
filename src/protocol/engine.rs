//! Control protocol engine — request/response correlation over a shared
//! byte stream, plus dispatch of the CLI's own inbound requests.
//!
//! Outbound requests register a pending entry keyed by a unique request
//! identifier and race three outcomes: a correlated response, the request
//! timeout, and the transport's cancellation scope. Inbound requests are
//! dispatched on their own spawned task — never on the reader — and always
//! produce exactly one `control_response`, success or error, so the CLI is
//! never left waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::hooks::{CanUseToolRequest, HookDispatch, PermissionUpdate};
use crate::protocol::{subtype, AgentDefinition, ControlMessage, ControlRequest, ControlResponse};
use crate::router::ToolRouter;
use crate::{AgentError, Result};

/// Default timeout for ordinary outbound control requests.
pub const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default — and floor — timeout for the initialize handshake.
pub const INITIALIZE_TIMEOUT_FLOOR: Duration = Duration::from_secs(60);

/// Environment variable overriding the initialize timeout, in milliseconds.
/// Values below the floor are clamped up: a too-short initialize timeout is
/// a common, hard-to-diagnose misconfiguration.
pub const INITIALIZE_TIMEOUT_ENV: &str = "CLAUDE_CODE_STREAM_CLOSE_TIMEOUT";

/// Engine lifecycle: `initialize` is the only legal transition out of
/// `Uninitialized`; `Closed` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Uninitialized,
    Initializing,
    Initialized,
    Closed,
}

type PendingTable = HashMap<String, oneshot::Sender<Result<Value>>>;

/// Correlation engine plus inbound-request dispatcher.
pub struct ProtocolEngine {
    outbound: mpsc::Sender<Value>,
    pending: Mutex<PendingTable>,
    counter: AtomicU64,
    state: Mutex<EngineState>,
    hooks: Arc<HookDispatch>,
    servers: HashMap<String, Arc<ToolRouter>>,
    cancel: CancellationToken,
}

impl ProtocolEngine {
    /// Create an engine writing envelopes to `outbound` (the transport's
    /// writer task) and dispatching inbound requests to `hooks` and the
    /// named in-process `servers`.
    #[must_use]
    pub fn new(
        outbound: mpsc::Sender<Value>,
        hooks: Arc<HookDispatch>,
        servers: HashMap<String, Arc<ToolRouter>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            state: Mutex::new(EngineState::Uninitialized),
            hooks,
            servers,
            cancel,
        }
    }

    /// Effective initialize timeout: the env override in milliseconds,
    /// clamped to the floor; the floor itself when unset or unparseable.
    #[must_use]
    pub fn initialize_timeout() -> Duration {
        match std::env::var(INITIALIZE_TIMEOUT_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(millis) => INITIALIZE_TIMEOUT_FLOOR.max(Duration::from_millis(millis)),
                Err(_) => {
                    warn!(
                        value = %raw,
                        "ignoring unparseable {INITIALIZE_TIMEOUT_ENV} override"
                    );
                    INITIALIZE_TIMEOUT_FLOOR
                }
            },
            Err(_) => INITIALIZE_TIMEOUT_FLOOR,
        }
    }

    /// Perform the initialize handshake.
    ///
    /// Sends a single `initialize` request carrying the hook dispatcher's
    /// exported matcher configuration and any named-agent definitions, and
    /// blocks until the response. Nothing else may be sent before this
    /// completes; only success marks the engine initialized.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Connection`] if called twice or after close.
    /// - [`AgentError::Timeout`] / the CLI's error response otherwise.
    pub async fn initialize(
        &self,
        agents: Option<&HashMap<String, AgentDefinition>>,
    ) -> Result<Value> {
        {
            let mut state = self.state.lock().await;
            match *state {
                EngineState::Uninitialized => *state = EngineState::Initializing,
                EngineState::Closed => {
                    return Err(AgentError::Connection("engine is closed".into()));
                }
                _ => {
                    return Err(AgentError::Connection(
                        "initialize may only be called once".into(),
                    ));
                }
            }
        }

        let mut payload = Map::new();
        if self.hooks.has_hooks() {
            payload.insert("hooks".into(), self.hooks.exported_config()?);
        }
        if let Some(agents) = agents {
            payload.insert("agents".into(), serde_json::to_value(agents)?);
        }

        let outcome = self
            .send_control_request(subtype::INITIALIZE, payload, Self::initialize_timeout())
            .await;

        let mut state = self.state.lock().await;
        match outcome {
            Ok(response) => {
                if *state != EngineState::Closed {
                    *state = EngineState::Initialized;
                }
                Ok(response)
            }
            Err(err) => {
                if *state != EngineState::Closed {
                    *state = EngineState::Uninitialized;
                }
                Err(err)
            }
        }
    }

    /// Send one outbound control request and await its correlated response.
    ///
    /// Exactly one of three outcomes wins: the response (success payload or
    /// the peer's error), the timeout, or the transport's cancellation. The
    /// losing paths remove the pending entry; nothing leaks.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Timeout`] tagged with the subtype on expiry.
    /// - [`AgentError::Connection`] when the transport is closed or closing.
    /// - The peer's error string as [`AgentError::Protocol`].
    pub async fn send_control_request(
        &self,
        request_subtype: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_sendable(request_subtype).await?;

        let request_id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let envelope = serde_json::to_value(ControlMessage::Request {
            request_id: request_id.clone(),
            request: ControlRequest {
                subtype: request_subtype.to_owned(),
                payload,
            },
        })?;

        if self.outbound.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(AgentError::Connection(
                "transport writer is closed".into(),
            ));
        }

        tokio::select! {
            biased;

            () = self.cancel.cancelled() => {
                self.pending.lock().await.remove(&request_id);
                Err(AgentError::Connection(format!(
                    "transport closed while awaiting {request_subtype} response"
                )))
            }

            outcome = rx => match outcome {
                Ok(result) => result,
                // Sender dropped without resolving — only fail_pending or a
                // bug can do this, and fail_pending sends an error first.
                Err(_) => Err(AgentError::Protocol(format!(
                    "pending entry for {request_subtype} dropped without a response"
                ))),
            },

            () = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&request_id);
                Err(AgentError::Timeout(format!(
                    "control request {request_subtype} timed out after {timeout:?}"
                )))
            }
        }
    }

    /// Route one inbound control envelope.
    ///
    /// Responses resolve pending entries inline (cheap); requests are
    /// dispatched on a spawned task so a slow callback can never stall the
    /// reader; cancel notices are acknowledged by logging.
    pub async fn handle_control_message(self: &Arc<Self>, message: ControlMessage) {
        match message {
            ControlMessage::Response { response } => self.handle_control_response(response).await,
            ControlMessage::Request {
                request_id,
                request,
            } => self.spawn_dispatch(request_id, request),
            ControlMessage::Cancel { request_id } => {
                // In-process dispatch is not torn down mid-flight; the spawned
                // task finishes and its response is dropped peer-side.
                debug!(request_id, "control engine: cancel request acknowledged");
            }
        }
    }

    /// Resolve the pending entry named by an inbound response.
    ///
    /// An unmatched request identifier is dropped silently — the request may
    /// have already timed out and discarded its entry.
    pub async fn handle_control_response(&self, response: ControlResponse) {
        let (request_id, outcome) = match response {
            ControlResponse::Success {
                request_id,
                response,
            } => (request_id, Ok(response.unwrap_or(Value::Null))),
            ControlResponse::Error { request_id, error } => {
                (request_id, Err(AgentError::Protocol(error)))
            }
        };

        let entry = self.pending.lock().await.remove(&request_id);
        match entry {
            Some(tx) => {
                // Receiver may have timed out between our lookup and the send.
                let _ = tx.send(outcome);
            }
            None => {
                debug!(
                    request_id,
                    "control engine: dropping response with no pending entry"
                );
            }
        }
    }

    /// Fail every currently pending outbound request with `err`.
    ///
    /// Called on fatal stream errors so failure detection is bounded by the
    /// stream error itself, not the slowest pending timeout.
    pub async fn fail_pending(&self, err: &AgentError) {
        let drained: Vec<(String, oneshot::Sender<Result<Value>>)> =
            self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            warn!(
                count = drained.len(),
                error = %err,
                "control engine: failing all pending requests"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Transition to `Closed`. Pending requests are released through the
    /// cancellation token the transport fires alongside this call.
    pub async fn close(&self) {
        *self.state.lock().await = EngineState::Closed;
    }

    // ── Admin wrappers ────────────────────────────────────────────────────────

    /// Interrupt the current turn.
    ///
    /// # Errors
    ///
    /// See [`Self::send_control_request`].
    pub async fn interrupt(&self) -> Result<()> {
        self.send_control_request(subtype::INTERRUPT, Map::new(), CONTROL_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Switch the session's permission mode.
    ///
    /// # Errors
    ///
    /// See [`Self::send_control_request`].
    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("mode".into(), Value::String(mode.to_owned()));
        self.send_control_request(
            subtype::SET_PERMISSION_MODE,
            payload,
            CONTROL_REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    /// Switch the session's model; `None` restores the default.
    ///
    /// # Errors
    ///
    /// See [`Self::send_control_request`].
    pub async fn set_model(&self, model: Option<&str>) -> Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "model".into(),
            model.map_or(Value::Null, |m| Value::String(m.to_owned())),
        );
        self.send_control_request(subtype::SET_MODEL, payload, CONTROL_REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Restore the named files to their state at an earlier point.
    ///
    /// # Errors
    ///
    /// See [`Self::send_control_request`].
    pub async fn rewind_files(&self, files: &[String]) -> Result<Value> {
        let mut payload = Map::new();
        payload.insert("files".into(), serde_json::to_value(files)?);
        self.send_control_request(subtype::REWIND_FILES, payload, CONTROL_REQUEST_TIMEOUT)
            .await
    }

    /// Query in-process server status as seen by the CLI.
    ///
    /// # Errors
    ///
    /// See [`Self::send_control_request`].
    pub async fn mcp_server_status(&self) -> Result<Value> {
        self.send_control_request(subtype::MCP_STATUS, Map::new(), CONTROL_REQUEST_TIMEOUT)
            .await
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    /// Unique request identifier: per-instance monotonic counter plus a
    /// nanosecond timestamp, so identifiers stay unique across restarts.
    fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("req_{n}_{nanos:x}")
    }

    async fn ensure_sendable(&self, request_subtype: &str) -> Result<()> {
        let state = *self.state.lock().await;
        match state {
            EngineState::Closed => Err(AgentError::Connection("engine is closed".into())),
            EngineState::Initializing if request_subtype == subtype::INITIALIZE => Ok(()),
            EngineState::Initialized => Ok(()),
            _ => Err(AgentError::Connection(format!(
                "cannot send {request_subtype} before initialize completes"
            ))),
        }
    }

    /// Dispatch one inbound request on its own task and write back exactly
    /// one response. A dispatch that errors — or panics — still produces a
    /// well-formed error response.
    fn spawn_dispatch(self: &Arc<Self>, request_id: String, request: ControlRequest) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let request_subtype = request.subtype.clone();
            let outcome = std::panic::AssertUnwindSafe(engine.dispatch_request(request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(AgentError::Protocol(format!(
                        "dispatch of {request_subtype} panicked"
                    )))
                });

            let response = match outcome {
                Ok(value) => ControlResponse::Success {
                    request_id,
                    response: Some(value),
                },
                Err(err) => ControlResponse::Error {
                    request_id,
                    error: err.message().to_owned(),
                },
            };

            match serde_json::to_value(ControlMessage::Response { response }) {
                Ok(envelope) => {
                    if engine.outbound.send(envelope).await.is_err() {
                        warn!(
                            subtype = %request_subtype,
                            "control engine: writer closed before response could be sent"
                        );
                    }
                }
                Err(err) => {
                    warn!(error = %err, "control engine: failed to serialize response");
                }
            }
        });
    }

    async fn dispatch_request(&self, request: ControlRequest) -> Result<Value> {
        match request.subtype.as_str() {
            subtype::CAN_USE_TOOL => self.dispatch_can_use_tool(&request.payload).await,
            subtype::HOOK_CALLBACK => self.dispatch_hook_callback(&request.payload).await,
            subtype::MCP_MESSAGE => self.dispatch_mcp_message(&request.payload).await,
            other => Err(AgentError::Protocol(format!(
                "unsupported control request subtype: {other}"
            ))),
        }
    }

    async fn dispatch_can_use_tool(&self, payload: &Map<String, Value>) -> Result<Value> {
        let tool_name = require_str(payload, "tool_name")?.to_owned();
        let input = payload.get("input").cloned().unwrap_or(Value::Null);
        let blocked_path = payload
            .get("blocked_path")
            .and_then(Value::as_str)
            .map(str::to_owned);

        // Lift loosely-typed wire suggestions into typed updates before the
        // callback sees them.
        let permission_suggestions = match payload.get("permission_suggestions") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<Vec<PermissionUpdate>>(raw.clone()).map_err(|e| {
                    AgentError::Protocol(format!("malformed permission_suggestions: {e}"))
                })?,
            ),
        };

        let result = self
            .hooks
            .process_can_use_tool(CanUseToolRequest {
                tool_name,
                input,
                permission_suggestions,
                blocked_path,
            })
            .await?;

        result.to_wire()
    }

    async fn dispatch_hook_callback(&self, payload: &Map<String, Value>) -> Result<Value> {
        let callback_id = require_str(payload, "callback_id")?;
        let input = payload.get("input").cloned().unwrap_or(Value::Null);
        let tool_use_id = payload
            .get("tool_use_id")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let output = self
            .hooks
            .process_hook_callback(callback_id, input, tool_use_id)
            .await?;
        Ok(json!({ "response": output }))
    }

    async fn dispatch_mcp_message(&self, payload: &Map<String, Value>) -> Result<Value> {
        let server_name = require_str(payload, "server_name")?;
        let message = payload
            .get("message")
            .cloned()
            .ok_or_else(|| AgentError::Protocol("mcp_message is missing `message`".into()))?;

        let router = self.servers.get(server_name).ok_or_else(|| {
            AgentError::Protocol(format!("no in-process server named {server_name}"))
        })?;

        let response = router.handle_jsonrpc(message).await.unwrap_or(json!({}));
        Ok(json!({ "mcp_response": response }))
    }
}

fn require_str<'a>(payload: &'a Map<String, Value>, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Protocol(format!("missing required field: `{field}`")))
}
