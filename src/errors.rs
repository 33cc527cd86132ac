//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Crate error enumeration covering all failure classes.
///
/// Connection errors are fatal to the current connect attempt and never
/// retried internally. Control-protocol errors (`Protocol`, `Timeout`) are
/// local to the caller awaiting that request. The `NotFound` variants are
/// kept distinct from their runtime-failure counterparts (`Hook`, `Tool`)
/// so configuration bugs can be told apart from callback failures.
#[derive(Debug, Clone)]
pub enum AgentError {
    /// Process failed to start, invalid working directory, double connect,
    /// initialize handshake failure, or use of a closed transport.
    Connection(String),
    /// Malformed control envelope, serialization failure, or framing error.
    Protocol(String),
    /// An outbound control request timed out; the message names the subtype.
    Timeout(String),
    /// Child process failure observed after the stream ended.
    Process(String),
    /// A hook callback ran and failed.
    Hook(String),
    /// No hook callback is registered under the requested identifier.
    HookNotFound(String),
    /// A tool definition was invalid or a tool handler failed.
    Tool(String),
    /// No tool is registered under the requested name.
    ToolNotFound(String),
    /// File-system or pipe I/O failure.
    Io(String),
}

impl AgentError {
    /// Inner message without the class prefix, for wire payloads that carry
    /// the bare reason (tool failure text, hook error strings).
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Connection(m)
            | Self::Protocol(m)
            | Self::Timeout(m)
            | Self::Process(m)
            | Self::Hook(m)
            | Self::HookNotFound(m)
            | Self::Tool(m)
            | Self::ToolNotFound(m)
            | Self::Io(m) => m,
        }
    }
}

impl Display for AgentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Hook(msg) => write!(f, "hook: {msg}"),
            Self::HookNotFound(msg) => write!(f, "hook not found: {msg}"),
            Self::Tool(msg) => write!(f, "tool: {msg}"),
            Self::ToolNotFound(msg) => write!(f, "tool not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {err}"))
    }
}
