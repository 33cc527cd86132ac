//! Unit tests for the stdout line demultiplexer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use agent_conduit::hooks::HookDispatch;
use agent_conduit::protocol::ProtocolEngine;
use agent_conduit::transport::codec::MAX_LINE_BYTES;
use agent_conduit::transport::reader::{run_reader, JsonLineParser, MessageParser};
use agent_conduit::{AgentError, Result};

/// Engine wired to an in-memory outbound channel; the receiver is returned
/// so outbound envelopes stay observable.
fn bare_engine() -> (Arc<ProtocolEngine>, mpsc::Receiver<Value>, CancellationToken) {
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let engine = Arc::new(ProtocolEngine::new(
        tx,
        Arc::new(HookDispatch::disabled(cancel.child_token())),
        HashMap::new(),
        cancel.clone(),
    ));
    (engine, rx, cancel)
}

/// Run the reader over a static byte script with no child process attached.
async fn read_script(
    engine: &Arc<ProtocolEngine>,
    parser: Arc<dyn MessageParser>,
    script: &str,
) -> mpsc::Receiver<Result<Value>> {
    let (message_tx, message_rx) = mpsc::channel(32);
    run_reader(
        script.as_bytes(),
        Arc::clone(engine),
        parser,
        message_tx,
        Arc::new(Mutex::new(None)),
        CancellationToken::new(),
    )
    .await;
    message_rx
}

// ── Data routing ─────────────────────────────────────────────────────────────

/// Data messages are forwarded downstream in stream order; EOF closes the
/// channel without an error.
#[tokio::test]
async fn data_lines_forward_in_order() {
    let (engine, _out, _cancel) = bare_engine();
    let script = concat!(
        "{\"type\":\"system\",\"subtype\":\"init\"}\n",
        "{\"type\":\"assistant\",\"message\":{}}\n",
        "{\"type\":\"result\",\"is_error\":false}\n",
    );

    let mut rx = read_script(&engine, Arc::new(JsonLineParser), script).await;

    let types: Vec<String> = [
        rx.recv().await, rx.recv().await, rx.recv().await,
    ]
    .into_iter()
    .map(|item| {
        item.expect("message present")
            .expect("message is Ok")["type"]
            .as_str()
            .expect("type tag")
            .to_owned()
    })
    .collect();
    assert_eq!(types, ["system", "assistant", "result"]);
    assert!(rx.recv().await.is_none(), "EOF must close the channel");
}

/// Control envelopes are consumed by the engine and never reach the data
/// channel.
#[tokio::test]
async fn control_lines_are_elided() {
    let (engine, _out, _cancel) = bare_engine();
    let script = concat!(
        "{\"type\":\"control_response\",\"response\":{\"subtype\":\"success\",\"request_id\":\"req_0_0\"}}\n",
        "{\"type\":\"control_cancel_request\",\"request_id\":\"req_0_1\"}\n",
        "{\"type\":\"assistant\",\"message\":{}}\n",
    );

    let mut rx = read_script(&engine, Arc::new(JsonLineParser), script).await;

    let only = rx
        .recv()
        .await
        .expect("one data message")
        .expect("message is Ok");
    assert_eq!(only["type"], "assistant");
    assert!(rx.recv().await.is_none(), "control lines must not leak through");
}

/// A `control_response` line resolves the pending entry of an in-flight
/// outbound request.
#[tokio::test]
async fn control_response_resolves_pending_request() {
    let (engine, mut out, _cancel) = bare_engine();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.initialize(None).await }
    });
    let envelope = out.recv().await.expect("initialize envelope");
    let request_id = envelope["request_id"].as_str().expect("request_id");

    let script = json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": { "commands": [] },
        },
    })
    .to_string()
        + "\n";
    let mut rx = read_script(&engine, Arc::new(JsonLineParser), &script).await;

    let outcome = in_flight.await.expect("task must not panic");
    assert_eq!(
        outcome.expect("initialize must resolve")["commands"],
        json!([])
    );
    assert!(rx.recv().await.is_none(), "the control line must be elided");
}

// ── Malformed input ──────────────────────────────────────────────────────────

/// Malformed JSON is surfaced downstream as an error without stopping the
/// stream; empty lines are skipped silently.
#[tokio::test]
async fn malformed_json_forwards_error_and_continues() {
    let (engine, _out, _cancel) = bare_engine();
    let script = concat!(
        "not json at all\n",
        "\n",
        "   \n",
        "{\"type\":\"result\"}\n",
    );

    let mut rx = read_script(&engine, Arc::new(JsonLineParser), script).await;

    let first = rx.recv().await.expect("error item");
    assert!(
        matches!(first, Err(AgentError::Protocol(ref msg)) if msg.contains("malformed json")),
        "malformed line must surface as a Protocol error, got: {first:?}"
    );

    let second = rx.recv().await.expect("data item").expect("Ok message");
    assert_eq!(second["type"], "result", "stream must continue past the error");
}

/// An oversized line is skipped; the following line is still delivered.
#[tokio::test]
async fn oversized_line_is_skipped() {
    let (engine, _out, _cancel) = bare_engine();
    let mut script = "x".repeat(MAX_LINE_BYTES + 16);
    script.push('\n');
    script.push_str("{\"type\":\"result\"}\n");

    let mut rx = read_script(&engine, Arc::new(JsonLineParser), &script).await;

    let only = rx.recv().await.expect("data item").expect("Ok message");
    assert_eq!(only["type"], "result", "the oversized line must be skipped");
    assert!(rx.recv().await.is_none());
}

// ── Parser seam ──────────────────────────────────────────────────────────────

/// Parser expanding a batch message into its parts, failing on a marker.
struct BatchParser;

impl MessageParser for BatchParser {
    fn parse(&self, raw: Value) -> Result<Vec<Value>> {
        if raw.get("bad").is_some() {
            return Err(AgentError::Protocol("unrecognized message shape".into()));
        }
        match raw.get("batch").and_then(Value::as_array) {
            Some(parts) => Ok(parts.clone()),
            None => Ok(vec![raw]),
        }
    }
}

/// A custom parser may expand one line into several messages or reject a
/// line; rejections forward downstream without stopping the stream.
#[tokio::test]
async fn custom_parser_expands_and_rejects() {
    let (engine, _out, _cancel) = bare_engine();
    let script = concat!(
        "{\"batch\":[{\"n\":1},{\"n\":2}]}\n",
        "{\"bad\":true}\n",
        "{\"n\":3}\n",
    );

    let mut rx = read_script(&engine, Arc::new(BatchParser), script).await;

    assert_eq!(rx.recv().await.expect("first").expect("Ok")["n"], 1);
    assert_eq!(rx.recv().await.expect("second").expect("Ok")["n"], 2);
    assert!(
        matches!(
            rx.recv().await.expect("third"),
            Err(AgentError::Protocol(_))
        ),
        "parser rejection must forward as an error"
    );
    assert_eq!(rx.recv().await.expect("fourth").expect("Ok")["n"], 3);
}

// ── Exit reporting ───────────────────────────────────────────────────────────

/// After EOF, a non-zero child exit code is reported downstream as a
/// `Process` error.
#[cfg(unix)]
#[tokio::test]
async fn nonzero_exit_is_reported_after_eof() {
    let (engine, _out, _cancel) = bare_engine();
    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "exit 3"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn sh");
    let stdout = child.stdout.take().expect("piped stdout");

    let (message_tx, mut rx) = mpsc::channel(8);
    run_reader(
        stdout,
        Arc::clone(&engine),
        Arc::new(JsonLineParser),
        message_tx,
        Arc::new(Mutex::new(Some(child))),
        CancellationToken::new(),
    )
    .await;

    let report = rx.recv().await.expect("exit report");
    match report {
        Err(AgentError::Process(msg)) => assert!(
            msg.contains("exit code: 3"),
            "report must carry the exit code, got: {msg}"
        ),
        other => panic!("expected Err(AgentError::Process), got: {other:?}"),
    }
}

/// A non-zero exit fails in-flight control requests immediately — a dead
/// child can never answer them, so they must not sit out their timeouts.
#[cfg(unix)]
#[tokio::test]
async fn nonzero_exit_fails_in_flight_requests() {
    let (engine, mut out, _cancel) = bare_engine();

    let in_flight = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.initialize(None).await }
    });
    out.recv().await.expect("initialize envelope");

    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "exit 7"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn sh");
    let stdout = child.stdout.take().expect("piped stdout");

    let (message_tx, mut rx) = mpsc::channel(8);
    run_reader(
        stdout,
        Arc::clone(&engine),
        Arc::new(JsonLineParser),
        message_tx,
        Arc::new(Mutex::new(Some(child))),
        CancellationToken::new(),
    )
    .await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), in_flight)
        .await
        .expect("pending request must fail promptly, not wait out its timeout")
        .expect("task must not panic");
    match outcome {
        Err(AgentError::Process(msg)) => assert!(
            msg.contains("exit code: 7"),
            "pending request must fail with the exit report, got: {msg}"
        ),
        other => panic!("expected Err(AgentError::Process), got: {other:?}"),
    }

    let report = rx.recv().await.expect("exit report");
    assert!(
        matches!(report, Err(AgentError::Process(_))),
        "the exit must also be reported downstream"
    );
}

/// A zero exit code is not an error; the channel just closes.
#[cfg(unix)]
#[tokio::test]
async fn zero_exit_closes_cleanly() {
    let (engine, _out, _cancel) = bare_engine();
    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "printf '{\"type\":\"result\"}\\n'; exit 0"])
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn sh");
    let stdout = child.stdout.take().expect("piped stdout");

    let (message_tx, mut rx) = mpsc::channel(8);
    run_reader(
        stdout,
        Arc::clone(&engine),
        Arc::new(JsonLineParser),
        message_tx,
        Arc::new(Mutex::new(Some(child))),
        CancellationToken::new(),
    )
    .await;

    let only = rx.recv().await.expect("data item").expect("Ok message");
    assert_eq!(only["type"], "result");
    assert!(rx.recv().await.is_none(), "clean exit must not report an error");
}

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cancelling the scope stops the reader even with the stream still open.
#[tokio::test]
async fn cancellation_stops_reader() {
    let (engine, _out, _cancel) = bare_engine();
    let (_writer, reader_half) = tokio::io::duplex(256);
    let cancel = CancellationToken::new();
    let (message_tx, _rx) = mpsc::channel(8);

    let task = tokio::spawn(run_reader(
        reader_half,
        Arc::clone(&engine),
        Arc::new(JsonLineParser),
        message_tx,
        Arc::new(Mutex::new(None)),
        cancel.clone(),
    ));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("reader must stop promptly on cancellation")
        .expect("reader task must not panic");
}
