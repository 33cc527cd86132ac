//! Subprocess transport — owns the agent CLI process and its pipes
//! end-to-end.
//!
//! `connect` spawns the child with a layered environment, wires the stdio
//! tasks (writer, stdout demultiplexer, optional stderr consumer), and
//! performs the control-protocol initialize handshake before declaring the
//! transport connected. `close` is idempotent and concurrency-safe: cancel
//! the task scope, half-close stdin, wait for the tasks with a bounded
//! grace, then terminate the process in two phases (graceful signal, wait,
//! force-kill) and reap it.
//!
//! The executable path and argument vector come fully formed from the
//! caller — CLI discovery and option translation are external
//! collaborators, as is the typed conversational message hierarchy (see
//! [`reader::MessageParser`]).

pub mod codec;
pub mod reader;
pub mod writer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hooks::{CanUseToolCallback, HookDispatch, HookEvent, HookMatcher};
use crate::protocol::{AgentDefinition, ProtocolEngine};
use crate::router::ToolRouter;
use crate::transport::reader::{JsonLineParser, MessageParser};
use crate::{AgentError, Result};

/// Grace period for the child to exit after the termination signal.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Grace period for reader/writer tasks to finish during close; expired
/// waits proceed anyway — the process kill unblocks stragglers.
const TASK_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Default capacity of the bounded data-message channel.
const MESSAGE_BUFFER: usize = 64;

/// Callback receiving one stderr line at a time.
pub type StderrCallback = Arc<dyn Fn(String) + Send + Sync>;

// ── Options ───────────────────────────────────────────────────────────────────

/// Configuration for one transport session.
pub struct TransportOptions {
    /// Agent CLI executable path, supplied fully resolved by the caller.
    pub cli_path: PathBuf,
    /// Fully-formed argument vector.
    pub args: Vec<String>,
    /// Working directory for the child; must exist and be a directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the ambient environment.
    /// SDK identification variables always win on key collision.
    pub extra_env: HashMap<String, String>,
    /// Hook matcher configuration, exported in the initialize payload.
    pub hooks: HashMap<HookEvent, Vec<HookMatcher>>,
    /// Permission callback for `can_use_tool` requests; absent fails closed.
    pub can_use_tool: Option<CanUseToolCallback>,
    /// In-process tool servers keyed by server name.
    pub sdk_servers: HashMap<String, Arc<ToolRouter>>,
    /// Named-agent definitions carried in the initialize payload.
    pub agents: Option<HashMap<String, AgentDefinition>>,
    /// Per-line stderr callback; configuring one turns the stderr pipe on.
    pub stderr_callback: Option<StderrCallback>,
    /// Log stderr lines at debug level even without a callback.
    pub debug_stderr: bool,
    /// Conversational-parse collaborator; defaults to verbatim forwarding.
    pub parser: Arc<dyn MessageParser>,
    /// Capacity of the bounded data-message channel.
    pub message_buffer: usize,
}

impl TransportOptions {
    /// Options for launching `cli_path` with `args` and defaults elsewhere.
    #[must_use]
    pub fn new(cli_path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            args,
            cwd: None,
            extra_env: HashMap::new(),
            hooks: HashMap::new(),
            can_use_tool: None,
            sdk_servers: HashMap::new(),
            agents: None,
            stderr_callback: None,
            debug_stderr: false,
            parser: Arc::new(JsonLineParser),
            message_buffer: MESSAGE_BUFFER,
        }
    }
}

// ── Connection state ──────────────────────────────────────────────────────────

struct Runtime {
    engine: Arc<ProtocolEngine>,
    writer_tx: mpsc::Sender<Value>,
    close_stdin: CancellationToken,
    cancel: CancellationToken,
    child: Arc<Mutex<Option<Child>>>,
    message_rx: Option<mpsc::Receiver<Result<Value>>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<Result<()>>,
    stderr_handle: Option<JoinHandle<()>>,
}

enum ConnState {
    Disconnected,
    Connected(Box<Runtime>),
    Closed,
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Owns one agent CLI child process and its duplexed stdio channel.
///
/// All state transitions (connect → running → closing → closed) are
/// serialized under one internal mutex, so `connect`, `close`, and the
/// send operations may be called from concurrent tasks.
pub struct SubprocessTransport {
    options: TransportOptions,
    state: Mutex<ConnState>,
}

impl SubprocessTransport {
    /// Build a transport from options; no process is started yet.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            state: Mutex::new(ConnState::Disconnected),
        }
    }

    /// Spawn the agent process, start the stdio tasks, and run the
    /// initialize handshake. The transport is connected only if every step
    /// — including the handshake — succeeds; any failure tears the child
    /// back down.
    ///
    /// # Errors
    ///
    /// [`AgentError::Connection`] for an invalid working directory, a spawn
    /// failure, a double connect, use after close, or handshake failure.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            ConnState::Disconnected => {}
            ConnState::Connected(_) => {
                return Err(AgentError::Connection("already connected".into()));
            }
            ConnState::Closed => {
                return Err(AgentError::Connection("transport is closed".into()));
            }
        }

        let runtime = self.start_process().await?;

        // Handshake before declaring the transport connected. A transport
        // that fails to initialize must not be usable.
        let init = runtime.engine.initialize(self.options.agents.as_ref()).await;
        if let Err(err) = init {
            warn!(error = %err, "transport: initialize handshake failed, tearing down");
            teardown(*runtime).await;
            return Err(AgentError::Connection(format!(
                "initialize handshake failed: {err}"
            )));
        }

        info!(cli = %self.options.cli_path.display(), "transport: connected");
        *state = ConnState::Connected(runtime);
        Ok(())
    }

    /// Whether the transport is currently connected.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ConnState::Connected(_))
    }

    /// Take the data-message receiver. Yields `Some` exactly once per
    /// connection; messages arrive in stream order with control traffic
    /// elided.
    pub async fn messages(&self) -> Option<mpsc::Receiver<Result<Value>>> {
        match *self.state.lock().await {
            ConnState::Connected(ref mut runtime) => runtime.message_rx.take(),
            _ => None,
        }
    }

    /// Write one data message as an NDJSON line to the child's stdin.
    ///
    /// # Errors
    ///
    /// [`AgentError::Connection`] when not connected or stdin has been
    /// closed by [`Self::end_input`].
    pub async fn send_message(&self, message: Value) -> Result<()> {
        let tx = {
            match *self.state.lock().await {
                ConnState::Connected(ref runtime) => runtime.writer_tx.clone(),
                _ => return Err(AgentError::Connection("transport is not connected".into())),
            }
        };
        tx.send(message)
            .await
            .map_err(|_| AgentError::Connection("agent stdin is closed".into()))
    }

    /// Close stdin so the child observes end-of-input. Required for
    /// one-shot, non-interactive sessions.
    ///
    /// # Errors
    ///
    /// [`AgentError::Connection`] when not connected.
    pub async fn end_input(&self) -> Result<()> {
        match *self.state.lock().await {
            ConnState::Connected(ref runtime) => {
                runtime.close_stdin.cancel();
                Ok(())
            }
            _ => Err(AgentError::Connection("transport is not connected".into())),
        }
    }

    /// Interrupt the current turn.
    ///
    /// # Errors
    ///
    /// Control-protocol errors from the underlying request.
    pub async fn interrupt(&self) -> Result<()> {
        self.engine().await?.interrupt().await
    }

    /// Switch the session's permission mode.
    ///
    /// # Errors
    ///
    /// Control-protocol errors from the underlying request.
    pub async fn set_permission_mode(&self, mode: &str) -> Result<()> {
        self.engine().await?.set_permission_mode(mode).await
    }

    /// Switch the session's model; `None` restores the default.
    ///
    /// # Errors
    ///
    /// Control-protocol errors from the underlying request.
    pub async fn set_model(&self, model: Option<&str>) -> Result<()> {
        self.engine().await?.set_model(model).await
    }

    /// Restore the named files to an earlier state.
    ///
    /// # Errors
    ///
    /// Control-protocol errors from the underlying request.
    pub async fn rewind_files(&self, files: &[String]) -> Result<Value> {
        self.engine().await?.rewind_files(files).await
    }

    /// Query in-process server status as seen by the CLI.
    ///
    /// # Errors
    ///
    /// Control-protocol errors from the underlying request.
    pub async fn mcp_server_status(&self) -> Result<Value> {
        self.engine().await?.mcp_server_status().await
    }

    /// Shut the transport down.
    ///
    /// Idempotent: the first call tears everything down, later calls (and
    /// concurrent callers, serialized by the state mutex) are no-ops. The
    /// underlying process handle is released exactly once.
    ///
    /// # Errors
    ///
    /// [`AgentError::Io`] only if reaping the child fails outright;
    /// "process already gone" conditions are success.
    pub async fn close(&self) -> Result<()> {
        let runtime = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ConnState::Closed) {
                ConnState::Connected(runtime) => runtime,
                // Never connected or already closed — nothing to release.
                _ => return Ok(()),
            }
        };

        teardown(*runtime).await;
        info!("transport: closed");
        Ok(())
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    async fn engine(&self) -> Result<Arc<ProtocolEngine>> {
        match *self.state.lock().await {
            ConnState::Connected(ref runtime) => Ok(Arc::clone(&runtime.engine)),
            _ => Err(AgentError::Connection("transport is not connected".into())),
        }
    }

    /// Spawn the child and start the stdio tasks, up to (but not including)
    /// the initialize handshake.
    async fn start_process(&self) -> Result<Box<Runtime>> {
        if let Some(cwd) = &self.options.cwd {
            if !cwd.is_dir() {
                return Err(AgentError::Connection(format!(
                    "working directory does not exist or is not a directory: {}",
                    cwd.display()
                )));
            }
        }

        let consume_stderr = self.options.stderr_callback.is_some() || self.options.debug_stderr;

        let mut cmd = Command::new(&self.options.cli_path);
        cmd.args(&self.options.args);

        // Env layering: ambient (inherited) → caller extras → SDK-reserved
        // identification variables, which always win so the child can tell
        // which SDK is driving it regardless of caller overrides.
        for (key, val) in &self.options.extra_env {
            cmd.env(key, val);
        }
        cmd.env("CLAUDE_CODE_ENTRYPOINT", "sdk-rust");
        cmd.env("CLAUDE_AGENT_SDK_VERSION", env!("CARGO_PKG_VERSION"));

        if let Some(cwd) = &self.options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(if consume_stderr {
                // Piped only when a consumer exists; an unread pipe would
                // fill and deadlock the child.
                std::process::Stdio::piped()
            } else {
                std::process::Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AgentError::Connection(format!(
                "failed to start agent process {}: {err}",
                self.options.cli_path.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Connection("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Connection("failed to capture agent stdout".into()))?;
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        let close_stdin = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel::<Value>(MESSAGE_BUFFER);
        let (message_tx, message_rx) = mpsc::channel(self.options.message_buffer.max(1));

        let hooks = Arc::new(HookDispatch::new(
            self.options.hooks.clone(),
            self.options.can_use_tool.clone(),
            cancel.child_token(),
        ));
        let engine = Arc::new(ProtocolEngine::new(
            writer_tx.clone(),
            hooks,
            self.options.sdk_servers.clone(),
            cancel.child_token(),
        ));

        let writer_handle = tokio::spawn(writer::run_writer(
            stdin,
            writer_rx,
            cancel.child_token(),
            close_stdin.clone(),
        ));

        let child = Arc::new(Mutex::new(Some(child)));
        let reader_handle = tokio::spawn(reader::run_reader(
            stdout,
            Arc::clone(&engine),
            Arc::clone(&self.options.parser),
            message_tx,
            Arc::clone(&child),
            cancel.child_token(),
        ));

        let stderr_handle = match (stderr, consume_stderr) {
            (Some(stderr), true) => Some(tokio::spawn(consume_stderr_lines(
                stderr,
                self.options.stderr_callback.clone(),
                cancel.child_token(),
            ))),
            _ => None,
        };

        Ok(Box::new(Runtime {
            engine,
            writer_tx,
            close_stdin,
            cancel,
            child,
            message_rx: Some(message_rx),
            reader_handle,
            writer_handle,
            stderr_handle,
        }))
    }
}

/// Stderr consumer: forwards each line to the callback when one is
/// configured, otherwise logs at debug level.
async fn consume_stderr_lines(
    stderr: tokio::process::ChildStderr,
    callback: Option<StderrCallback>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => match &callback {
                    Some(cb) => cb(line),
                    None => debug!(target: "agent_conduit::stderr", "{line}"),
                },
                Ok(None) | Err(_) => break,
            },
        }
    }
}

/// Ordered teardown shared by `close` and a failed handshake.
async fn teardown(runtime: Runtime) {
    runtime.engine.close().await;
    runtime.cancel.cancel();
    runtime.close_stdin.cancel();

    // Bounded wait for the stdio tasks; the process kill below unblocks
    // any that outlive the grace.
    let _ = tokio::time::timeout(TASK_JOIN_GRACE, runtime.reader_handle).await;
    let _ = tokio::time::timeout(TASK_JOIN_GRACE, runtime.writer_handle).await;
    if let Some(handle) = runtime.stderr_handle {
        let _ = tokio::time::timeout(TASK_JOIN_GRACE, handle).await;
    }

    // Capture the handle outside the slot so a concurrent task holding the
    // slot cannot race the kill sequence.
    let child = runtime.child.lock().await.take();
    if let Some(child) = child {
        if let Err(err) = terminate_process(child).await {
            warn!(error = %err, "transport: process termination failed");
        }
    }
}

/// Two-phase termination: graceful signal, bounded wait, force-kill, reap.
///
/// "Process already gone" conditions — an already-reaped handle, signal
/// delivery to a dead process, or an exit status induced by our own signal
/// — are success, not shutdown failures.
///
/// # Errors
///
/// [`AgentError::Io`] only when waiting on or killing the child fails at
/// the OS level.
pub async fn terminate_process(mut child: Child) -> Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped.
        let _ = child.wait().await;
        return Ok(());
    };

    if !signal_terminate(pid) {
        // Signal delivery failed because the process is already gone.
        let _ = child.wait().await;
        return Ok(());
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "transport: agent exited after termination signal");
            Ok(())
        }
        Ok(Err(err)) => Err(AgentError::Io(format!(
            "failed to reap agent process: {err}"
        ))),
        Err(_) => {
            warn!(pid, "transport: grace period expired, force-killing agent");
            child
                .kill()
                .await
                .map_err(|err| AgentError::Io(format!("failed to kill agent process: {err}")))
        }
    }
}

/// Deliver the graceful termination signal. Returns `false` when the
/// process is already gone, classified by structured OS error codes rather
/// than error-message text.
#[cfg(unix)]
fn signal_terminate(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pid, error = %err, "transport: SIGTERM delivery failed");
            // Fall through to the bounded wait; the force-kill phase will
            // finish the job if the process is still alive.
            true
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> bool {
    // No graceful signal on this platform; rely on the force-kill phase.
    true
}
