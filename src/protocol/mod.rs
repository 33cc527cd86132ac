//! Control-protocol wire types.
//!
//! The agent CLI multiplexes two traffic classes on one NDJSON stream:
//! conversational data messages and the control protocol. Control traffic
//! is identified by the top-level `type` tag, which takes one of three
//! values:
//!
//! | `type`                   | Maps to                          |
//! |--------------------------|----------------------------------|
//! | `control_request`        | [`ControlMessage::Request`]      |
//! | `control_response`       | [`ControlMessage::Response`]     |
//! | `control_cancel_request` | [`ControlMessage::Cancel`]       |
//! | *(any other)*            | Conversational data message      |
//!
//! Both sides issue requests: the SDK sends `initialize`, `interrupt`,
//! `set_model`, and friends; the CLI sends `can_use_tool`, `hook_callback`,
//! and `mcp_message`. Responses correlate by `request_id` only — stream
//! order carries no meaning for the control plane.

pub mod engine;

pub use engine::ProtocolEngine;

use serde::{Deserialize, Serialize};

/// Control request subtypes spoken by this crate.
pub mod subtype {
    /// Handshake request sent once before anything else.
    pub const INITIALIZE: &str = "initialize";
    /// Inbound permission check for a tool invocation.
    pub const CAN_USE_TOOL: &str = "can_use_tool";
    /// Inbound hook callback dispatch by identifier.
    pub const HOOK_CALLBACK: &str = "hook_callback";
    /// Inbound JSON-RPC message for an in-process tool server.
    pub const MCP_MESSAGE: &str = "mcp_message";
    /// Outbound query for in-process server status.
    pub const MCP_STATUS: &str = "mcp_status";
    /// Outbound permission mode switch.
    pub const SET_PERMISSION_MODE: &str = "set_permission_mode";
    /// Outbound model switch.
    pub const SET_MODEL: &str = "set_model";
    /// Outbound turn interruption.
    pub const INTERRUPT: &str = "interrupt";
    /// Outbound request to restore files to an earlier state.
    pub const REWIND_FILES: &str = "rewind_files";
}

/// Top-level control envelope, tagged by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// A request issued by either side, answered by exactly one response.
    #[serde(rename = "control_request")]
    Request {
        /// Correlation identifier; unique among the sender's in-flight requests.
        request_id: String,
        /// Subtype plus free-form payload.
        request: ControlRequest,
    },
    /// A response correlating to a previously received request.
    #[serde(rename = "control_response")]
    Response {
        /// Success or error payload.
        response: ControlResponse,
    },
    /// Abandonment notice for an in-flight request.
    #[serde(rename = "control_cancel_request")]
    Cancel {
        /// Identifier of the request to abandon.
        request_id: String,
    },
}

/// Body of a `control_request` envelope: a subtype discriminator plus
/// whatever fields that subtype carries, kept as a raw map because the
/// payload shape is owned by the dispatch target, not the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Request subtype; see [`subtype`].
    pub subtype: String,
    /// Subtype-specific fields, flattened alongside `subtype` on the wire.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Body of a `control_response` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype")]
pub enum ControlResponse {
    /// The request succeeded; `response` carries the result payload, if any.
    #[serde(rename = "success")]
    Success {
        /// Identifier of the originating request.
        request_id: String,
        /// Result payload; absent for acknowledgement-only responses.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<serde_json::Value>,
    },
    /// The request failed; `error` carries a human-readable reason.
    #[serde(rename = "error")]
    Error {
        /// Identifier of the originating request.
        request_id: String,
        /// Stringified failure reason.
        error: String,
    },
}

/// Named-agent definition carried verbatim in the initialize payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Short description shown when the agent is offered for delegation.
    pub description: String,
    /// System prompt the agent runs with.
    pub prompt: String,
    /// Tool allowlist; `None` inherits the session's tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    /// Model override; `None` inherits the session's model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Whether a top-level `type` tag names one of the three control envelope
/// kinds. Used by the line demultiplexer for its cheap routing peek.
#[must_use]
pub fn is_control_type(type_tag: &str) -> bool {
    matches!(
        type_tag,
        "control_request" | "control_response" | "control_cancel_request"
    )
}
