//! Hook dispatch — binding user callbacks to server-visible identifiers.
//!
//! The agent CLI does not hold function pointers; it binds hook callbacks
//! to lifecycle events by opaque identifier. This module builds that
//! binding once from declarative matcher configuration, exports it for the
//! initialize payload, and answers dispatch requests by identifier.
//!
//! Identifier allocation happens while iterating the matchers, never by
//! comparing callback identities after the fact: two matchers referencing
//! the same callback still receive distinct identifiers, so the CLI can
//! never alias one matcher's binding to another's.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{AgentError, Result};

// ── Callback types ────────────────────────────────────────────────────────────

/// Per-invocation context handed to hook callbacks.
///
/// The token is a child of the transport's cancellation scope; callbacks
/// running long work should select against it.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// Fires when the owning transport shuts down.
    pub cancel: CancellationToken,
}

/// A user hook callback.
///
/// Receives the raw event input (an object or a bare scalar depending on
/// the event — callbacks must not assume shape), the tool-use identifier
/// when the event is tied to one, and a [`HookContext`].
pub type HookCallback = Arc<
    dyn Fn(Value, Option<String>, HookContext) -> BoxFuture<'static, Result<Value>> + Send + Sync,
>;

/// The permission callback consulted for `can_use_tool` requests.
pub type CanUseToolCallback =
    Arc<dyn Fn(CanUseToolRequest) -> BoxFuture<'static, Result<PermissionResult>> + Send + Sync>;

// ── Event and matcher configuration ───────────────────────────────────────────

/// Lifecycle events the CLI can forward to hook callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// Fires before a tool call executes.
    PreToolUse,
    /// Fires after a tool call completes.
    PostToolUse,
    /// Fires when the user submits a prompt.
    UserPromptSubmit,
    /// Fires when the main turn stops.
    Stop,
    /// Fires when a subagent turn stops.
    SubagentStop,
    /// Fires before conversation compaction.
    PreCompact,
    /// Fires when a session starts or resumes.
    SessionStart,
    /// Fires when a session ends.
    SessionEnd,
    /// Fires for user-visible notifications.
    Notification,
}

impl HookEvent {
    /// Wire name of the event, as the CLI spells it.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::Stop => "Stop",
            Self::SubagentStop => "SubagentStop",
            Self::PreCompact => "PreCompact",
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::Notification => "Notification",
        }
    }
}

/// One matcher: an optional filter pattern (e.g. a tool name) plus the
/// ordered callbacks that fire when the filter selects an event occurrence.
#[derive(Clone)]
pub struct HookMatcher {
    /// Filter pattern; `None` matches every occurrence of the event.
    pub matcher: Option<String>,
    /// Callbacks invoked in order.
    pub hooks: Vec<HookCallback>,
    /// Optional per-matcher timeout, in seconds, enforced CLI-side.
    pub timeout_secs: Option<u64>,
}

/// Matcher entry as exported to the CLI in the initialize payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ExportedMatcher {
    #[serde(skip_serializing_if = "Option::is_none")]
    matcher: Option<String>,
    #[serde(rename = "hookCallbackIds")]
    hook_callback_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

// ── Permission types ──────────────────────────────────────────────────────────

/// One rule inside a [`PermissionUpdate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRuleValue {
    /// Tool the rule applies to.
    pub tool_name: String,
    /// Rule content in the CLI's pattern syntax; `None` matches any use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_content: Option<String>,
}

/// A strongly-shaped permission change, converted from the loosely-typed
/// wire suggestions before any callback sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionUpdate {
    /// Update kind (`addRules`, `replaceRules`, `removeRules`, `setMode`,
    /// `addDirectories`, `removeDirectories`).
    #[serde(rename = "type")]
    pub update_type: String,
    /// Rules affected, for the rule-oriented kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<PermissionRuleValue>>,
    /// Behavior the rules grant (`allow`, `deny`, `ask`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
    /// Mode name, for `setMode`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Directories affected, for the directory-oriented kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directories: Option<Vec<String>>,
    /// Settings destination (`session`, `projectSettings`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

/// An inbound permission check, already lifted out of the wire shape.
#[derive(Debug, Clone)]
pub struct CanUseToolRequest {
    /// Tool the CLI wants to invoke.
    pub tool_name: String,
    /// Proposed tool input.
    pub input: Value,
    /// Permission updates the CLI suggests granting.
    pub permission_suggestions: Option<Vec<PermissionUpdate>>,
    /// Path that tripped a permission rule, when one did.
    pub blocked_path: Option<String>,
}

/// Outcome of a permission check.
///
/// Allow and deny carry different optional payloads, which is why this is
/// a closed two-variant result and not a boolean.
#[derive(Debug, Clone)]
pub enum PermissionResult {
    /// Permit the tool call.
    Allow {
        /// Replacement tool input; `None` keeps the proposed input.
        updated_input: Option<Value>,
        /// Permission updates to apply alongside the allowance.
        updated_permissions: Option<Vec<PermissionUpdate>>,
    },
    /// Refuse the tool call.
    Deny {
        /// Human-readable reason shown in the conversation.
        message: String,
        /// Whether to interrupt the whole turn rather than just this call.
        interrupt: bool,
    },
}

impl PermissionResult {
    /// Serialize to the `{behavior: allow|deny, …}` wire shape.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Protocol`] if a permission update fails to
    /// serialize (it cannot for the derived types, but the signature keeps
    /// the seam honest).
    pub fn to_wire(&self) -> Result<Value> {
        match self {
            Self::Allow {
                updated_input,
                updated_permissions,
            } => {
                let mut obj = serde_json::Map::new();
                obj.insert("behavior".into(), Value::String("allow".into()));
                if let Some(input) = updated_input {
                    obj.insert("updatedInput".into(), input.clone());
                }
                if let Some(updates) = updated_permissions {
                    obj.insert("updatedPermissions".into(), serde_json::to_value(updates)?);
                }
                Ok(Value::Object(obj))
            }
            Self::Deny { message, interrupt } => Ok(serde_json::json!({
                "behavior": "deny",
                "message": message,
                "interrupt": interrupt,
            })),
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Immutable registry binding callback identifiers to user callbacks.
///
/// Built once at construction from matcher configuration; there is no
/// dynamic registration mid-session.
pub struct HookDispatch {
    callbacks: HashMap<String, HookCallback>,
    exported: Vec<(HookEvent, Vec<ExportedMatcher>)>,
    can_use_tool: Option<CanUseToolCallback>,
    cancel: CancellationToken,
}

impl HookDispatch {
    /// Build the registry from event/matcher configuration.
    ///
    /// Each callback occurrence receives a fresh `hook_<n>` identifier from
    /// a counter owned by this instance; identifiers are never reused, even
    /// for repeated references to the same callback. Events are exported in
    /// wire-name order so the initialize payload is deterministic.
    #[must_use]
    pub fn new(
        config: HashMap<HookEvent, Vec<HookMatcher>>,
        can_use_tool: Option<CanUseToolCallback>,
        cancel: CancellationToken,
    ) -> Self {
        let mut callbacks = HashMap::new();
        let mut exported = Vec::new();
        let mut next_id: u64 = 0;

        let mut events: Vec<(HookEvent, Vec<HookMatcher>)> = config.into_iter().collect();
        events.sort_by_key(|(event, _)| event.as_str());

        for (event, matchers) in events {
            let mut exported_matchers = Vec::with_capacity(matchers.len());
            for matcher in matchers {
                let mut ids = Vec::with_capacity(matcher.hooks.len());
                for callback in matcher.hooks {
                    let id = format!("hook_{next_id}");
                    next_id += 1;
                    callbacks.insert(id.clone(), callback);
                    ids.push(id);
                }
                exported_matchers.push(ExportedMatcher {
                    matcher: matcher.matcher,
                    hook_callback_ids: ids,
                    timeout: matcher.timeout_secs,
                });
            }
            exported.push((event, exported_matchers));
        }

        Self {
            callbacks,
            exported,
            can_use_tool,
            cancel,
        }
    }

    /// Registry with no hooks and no permission callback.
    #[must_use]
    pub fn disabled(cancel: CancellationToken) -> Self {
        Self::new(HashMap::new(), None, cancel)
    }

    /// Whether any hook matcher is configured.
    #[must_use]
    pub fn has_hooks(&self) -> bool {
        !self.exported.is_empty()
    }

    /// Exported matcher configuration for the initialize payload:
    /// event wire name → ordered matcher entries.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Protocol`] on serialization failure.
    pub fn exported_config(&self) -> Result<Value> {
        let mut obj = serde_json::Map::new();
        for (event, matchers) in &self.exported {
            obj.insert(event.as_str().into(), serde_json::to_value(matchers)?);
        }
        Ok(Value::Object(obj))
    }

    /// Invoke the callback registered under `callback_id`.
    ///
    /// # Errors
    ///
    /// - [`AgentError::HookNotFound`] for an unknown identifier — a protocol
    ///   desync, not a silent no-op.
    /// - The callback's own error otherwise.
    pub async fn process_hook_callback(
        &self,
        callback_id: &str,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<Value> {
        let callback = self.callbacks.get(callback_id).ok_or_else(|| {
            AgentError::HookNotFound(format!("no hook callback found for id {callback_id}"))
        })?;

        debug!(callback_id, "hook dispatch: invoking callback");
        let context = HookContext {
            cancel: self.cancel.child_token(),
        };
        callback(input, tool_use_id, context).await
    }

    /// Run the permission callback for an inbound `can_use_tool` request.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Hook`] when no permission callback is configured —
    ///   absence fails closed, it is never an implicit allow.
    /// - The callback's own error otherwise.
    pub async fn process_can_use_tool(
        &self,
        request: CanUseToolRequest,
    ) -> Result<PermissionResult> {
        let callback = self.can_use_tool.as_ref().ok_or_else(|| {
            AgentError::Hook("can_use_tool callback is not provided".into())
        })?;

        debug!(tool_name = %request.tool_name, "hook dispatch: permission check");
        callback(request).await
    }
}
