//! Unit tests for hook identifier allocation, config export, and dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use agent_conduit::hooks::{
    CanUseToolRequest, HookCallback, HookDispatch, HookEvent, HookMatcher, PermissionResult,
};
use agent_conduit::AgentError;

/// Callback that returns a fixed value regardless of input.
fn const_hook(output: Value) -> HookCallback {
    Arc::new(move |_input, _tool_use_id, _ctx| {
        let output = output.clone();
        async move { Ok(output) }.boxed()
    })
}

/// Callback that echoes its input and tool-use identifier back.
fn echo_hook() -> HookCallback {
    Arc::new(|input, tool_use_id, _ctx| {
        async move { Ok(json!({ "input": input, "tool_use_id": tool_use_id })) }.boxed()
    })
}

fn single_event_config(
    event: HookEvent,
    matchers: Vec<HookMatcher>,
) -> HashMap<HookEvent, Vec<HookMatcher>> {
    let mut config = HashMap::new();
    config.insert(event, matchers);
    config
}

// ── Identifier allocation ────────────────────────────────────────────────────

/// Two matchers referencing the same callback still receive distinct
/// identifiers — bindings never alias — and dispatching each identifier
/// runs the shared callback exactly once.
#[tokio::test]
async fn repeated_callback_gets_distinct_ids() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let shared: HookCallback = Arc::new({
        let invocations = Arc::clone(&invocations);
        move |_input, _tool_use_id, _ctx| {
            invocations.fetch_add(1, Ordering::SeqCst);
            async move { Ok(json!({})) }.boxed()
        }
    });
    let config = single_event_config(
        HookEvent::PreToolUse,
        vec![
            HookMatcher {
                matcher: Some("Bash".into()),
                hooks: vec![Arc::clone(&shared)],
                timeout_secs: None,
            },
            HookMatcher {
                matcher: Some("Edit".into()),
                hooks: vec![shared],
                timeout_secs: None,
            },
        ],
    );
    let dispatch = HookDispatch::new(config, None, CancellationToken::new());

    let exported = dispatch.exported_config().expect("export");
    let matchers = exported["PreToolUse"]
        .as_array()
        .expect("PreToolUse must export an array");
    let first = matchers[0]["hookCallbackIds"][0]
        .as_str()
        .expect("first id");
    let second = matchers[1]["hookCallbackIds"][0]
        .as_str()
        .expect("second id");

    assert_ne!(first, second, "same callback must get fresh ids per binding");
    assert!(first.starts_with("hook_"), "ids use the hook_ prefix: {first}");

    for id in [first, second] {
        dispatch
            .process_hook_callback(id, json!({}), None)
            .await
            .expect("each bound id must dispatch to the shared callback");
    }
    assert_eq!(
        invocations.load(Ordering::SeqCst),
        2,
        "the shared callback must run once per dispatched binding"
    );
}

// ── Config export ────────────────────────────────────────────────────────────

/// The exported config keys events by wire name and carries matcher,
/// callback identifiers, and timeout per entry.
#[test]
fn exported_config_carries_matcher_fields() {
    let config = single_event_config(
        HookEvent::PostToolUse,
        vec![HookMatcher {
            matcher: Some("Write".into()),
            hooks: vec![const_hook(json!({})), const_hook(json!({}))],
            timeout_secs: Some(30),
        }],
    );
    let dispatch = HookDispatch::new(config, None, CancellationToken::new());
    assert!(dispatch.has_hooks());

    let exported = dispatch.exported_config().expect("export");
    let entry = &exported["PostToolUse"][0];
    assert_eq!(entry["matcher"], "Write");
    assert_eq!(entry["timeout"], 30);
    assert_eq!(
        entry["hookCallbackIds"]
            .as_array()
            .expect("ids array")
            .len(),
        2,
        "both callbacks must be bound"
    );
}

/// A matcher without filter or timeout omits those fields on the wire.
#[test]
fn exported_config_omits_absent_fields() {
    let config = single_event_config(
        HookEvent::Stop,
        vec![HookMatcher {
            matcher: None,
            hooks: vec![const_hook(json!({}))],
            timeout_secs: None,
        }],
    );
    let dispatch = HookDispatch::new(config, None, CancellationToken::new());

    let exported = dispatch.exported_config().expect("export");
    let entry = &exported["Stop"][0];
    assert!(entry.get("matcher").is_none(), "absent matcher must be omitted");
    assert!(entry.get("timeout").is_none(), "absent timeout must be omitted");
}

/// A dispatcher with no configuration exports nothing and reports no hooks.
#[test]
fn disabled_dispatcher_has_no_hooks() {
    let dispatch = HookDispatch::disabled(CancellationToken::new());
    assert!(!dispatch.has_hooks());

    let exported = dispatch.exported_config().expect("export");
    assert_eq!(exported, json!({}), "empty config must export an empty object");
}

// ── Callback dispatch ────────────────────────────────────────────────────────

/// A registered callback is invoked with the event input and tool-use
/// identifier it was dispatched with.
#[tokio::test]
async fn hook_callback_receives_input_and_tool_use_id() {
    let config = single_event_config(
        HookEvent::PreToolUse,
        vec![HookMatcher {
            matcher: None,
            hooks: vec![echo_hook()],
            timeout_secs: None,
        }],
    );
    let dispatch = HookDispatch::new(config, None, CancellationToken::new());

    let exported = dispatch.exported_config().expect("export");
    let id = exported["PreToolUse"][0]["hookCallbackIds"][0]
        .as_str()
        .expect("allocated id")
        .to_owned();

    let output = dispatch
        .process_hook_callback(&id, json!({"tool_name": "Bash"}), Some("toolu_01".into()))
        .await
        .expect("callback must succeed");

    assert_eq!(output["input"]["tool_name"], "Bash");
    assert_eq!(output["tool_use_id"], "toolu_01");
}

/// Dispatch to an unknown identifier is a protocol desync, reported as
/// `HookNotFound` rather than silently ignored.
#[tokio::test]
async fn unknown_callback_id_returns_hook_not_found() {
    let dispatch = HookDispatch::disabled(CancellationToken::new());

    let result = dispatch
        .process_hook_callback("hook_999", json!({}), None)
        .await;

    match result {
        Err(AgentError::HookNotFound(msg)) => assert!(
            msg.contains("hook_999"),
            "error must name the unknown id, got: {msg}"
        ),
        other => panic!("expected Err(AgentError::HookNotFound), got: {other:?}"),
    }
}

// ── Permission checks ────────────────────────────────────────────────────────

/// With no permission callback configured, a `can_use_tool` check fails
/// closed — it never becomes an implicit allow.
#[tokio::test]
async fn missing_permission_callback_fails_closed() {
    let dispatch = HookDispatch::disabled(CancellationToken::new());

    let result = dispatch
        .process_can_use_tool(CanUseToolRequest {
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
            permission_suggestions: None,
            blocked_path: None,
        })
        .await;

    match result {
        Err(AgentError::Hook(msg)) => assert!(
            msg.contains("can_use_tool callback is not provided"),
            "error must report the missing callback, got: {msg}"
        ),
        other => panic!("expected Err(AgentError::Hook), got: {other:?}"),
    }
}

/// A configured permission callback sees the request and its decision is
/// returned unchanged.
#[tokio::test]
async fn permission_callback_decision_is_returned() {
    let can_use_tool = Arc::new(|request: CanUseToolRequest| {
        async move {
            if request.tool_name == "Bash" {
                Ok(PermissionResult::Deny {
                    message: "shell access disabled".into(),
                    interrupt: false,
                })
            } else {
                Ok(PermissionResult::Allow {
                    updated_input: None,
                    updated_permissions: None,
                })
            }
        }
        .boxed()
    });
    let dispatch = HookDispatch::new(HashMap::new(), Some(can_use_tool), CancellationToken::new());

    let result = dispatch
        .process_can_use_tool(CanUseToolRequest {
            tool_name: "Bash".into(),
            input: json!({}),
            permission_suggestions: None,
            blocked_path: None,
        })
        .await
        .expect("callback must run");

    match result {
        PermissionResult::Deny { message, interrupt } => {
            assert_eq!(message, "shell access disabled");
            assert!(!interrupt);
        }
        PermissionResult::Allow { .. } => panic!("Bash must be denied"),
    }
}
