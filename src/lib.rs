#![forbid(unsafe_code)]

//! `agent-conduit` — drive a long-lived agent CLI over stdio.
//!
//! One newline-delimited JSON byte stream carries two traffic classes:
//! conversational data messages flowing to the caller, and an administrative
//! control protocol (permission checks, hook callbacks, in-process tool
//! calls, interrupt/model-switch commands). The crate owns the child
//! process end-to-end: spawn, handshake, duplexed read/write tasks, and
//! bounded-time teardown under every exit path.

pub mod errors;
pub mod hooks;
pub mod protocol;
pub mod router;
pub mod transport;

pub use errors::{AgentError, Result};
pub use transport::{SubprocessTransport, TransportOptions};
