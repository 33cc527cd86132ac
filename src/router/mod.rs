//! In-process tool router — a minimal same-process JSON-RPC server.
//!
//! Tools registered here run inside the SDK process instead of behind a
//! separate server subprocess; the agent CLI reaches them through
//! `mcp_message` control requests carrying one JSON-RPC request each.
//!
//! Registration is last-write-wins under the write half of an [`RwLock`];
//! listing and invocation take the read half, so concurrent calls against
//! different tools proceed fully in parallel while a registration briefly
//! excludes them.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{AgentError, Result};

/// JSON-RPC error code for unparseable request text.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code for a structurally invalid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code for invalid params (also used for unknown tools).
pub const INVALID_PARAMS: i64 = -32602;

/// Protocol revision reported from the `initialize` method.
const PROTOCOL_VERSION: &str = "2024-11-05";

// ── Definitions ───────────────────────────────────────────────────────────────

/// A tool handler: raw argument object in, result payload out.
///
/// A handler error is not a transport failure — the router converts it into
/// a displayable `is_error` result so the conversation can continue.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Declared input shape for a tool: either a terse `name → type-string`
/// map or a fully-specified JSON schema document. Both normalize to one
/// schema shape before the CLI sees them.
#[derive(Debug, Clone)]
pub enum InputSchema {
    /// Terse form: property name → type string (`string`, `number`,
    /// `integer`, `boolean`, `array`, `object`). Every property is required.
    Properties(HashMap<String, String>),
    /// Verbose form: a complete JSON schema document, used verbatim.
    Document(Value),
}

impl InputSchema {
    /// Normalize into a full object schema.
    #[must_use]
    pub fn normalize(&self) -> Value {
        match self {
            Self::Document(doc) => doc.clone(),
            Self::Properties(map) => {
                let mut names: Vec<&String> = map.keys().collect();
                names.sort();

                let mut properties = serde_json::Map::new();
                for name in &names {
                    let type_name = map.get(*name).map_or("string", String::as_str);
                    properties.insert((*name).clone(), json!({ "type": type_name }));
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": names,
                })
            }
        }
    }
}

/// A tool offered to the agent CLI.
#[derive(Clone)]
pub struct ToolDefinition {
    /// Unique tool name; the registry key.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// Declared input shape.
    pub input_schema: InputSchema,
    /// Handler invoked for `tools/call`. Kept optional so a definition
    /// missing its handler is expressible — and rejected — at registration.
    pub handler: Option<ToolHandler>,
}

struct RegisteredTool {
    description: String,
    schema: Value,
    handler: ToolHandler,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Registry plus JSON-RPC dispatch for in-process tools.
pub struct ToolRouter {
    name: String,
    version: String,
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRouter {
    /// Create an empty router advertising `name`/`version` as its server info.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Server name advertised from `initialize`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a tool. Re-registering a name overwrites the prior
    /// definition (last write wins).
    ///
    /// # Errors
    ///
    /// - [`AgentError::Tool`]`("tool name must not be empty")`
    /// - [`AgentError::Tool`]`("tool \"<name>\" is missing a handler")`
    pub async fn register_tool(&self, definition: ToolDefinition) -> Result<()> {
        if definition.name.is_empty() {
            return Err(AgentError::Tool("tool name must not be empty".into()));
        }
        let Some(handler) = definition.handler else {
            return Err(AgentError::Tool(format!(
                "tool \"{}\" is missing a handler",
                definition.name
            )));
        };

        let registered = RegisteredTool {
            description: definition.description,
            schema: definition.input_schema.normalize(),
            handler,
        };

        let mut tools = self.tools.write().await;
        if tools.insert(definition.name.clone(), registered).is_some() {
            debug!(name = %definition.name, "tool router: definition overwritten");
        }
        Ok(())
    }

    /// List registered tools with normalized schemas, sorted by name.
    pub async fn list_tools(&self) -> Vec<Value> {
        let tools = self.tools.read().await;
        let mut names: Vec<&String> = tools.keys().collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| {
                tools.get(*name).map(|tool| {
                    json!({
                        "name": name,
                        "description": tool.description,
                        "inputSchema": tool.schema,
                    })
                })
            })
            .collect()
    }

    /// Invoke a registered tool. The read lock is held across the handler
    /// so invocation never races a registration.
    ///
    /// # Errors
    ///
    /// - [`AgentError::ToolNotFound`] for an unknown name.
    /// - The handler's own error, returned as-is.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let tools = self.tools.read().await;
        let tool = tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_owned()))?;
        (tool.handler)(arguments).await
    }

    /// Dispatch one raw JSON-RPC request string.
    ///
    /// Unparseable text maps to a `-32700` error response rather than a
    /// crate error — the peer always gets a well-formed reply.
    pub async fn handle_raw(&self, raw: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(request) => self.handle_jsonrpc(request).await,
            Err(err) => Some(error_response(
                Value::Null,
                PARSE_ERROR,
                &format!("parse error: {err}"),
            )),
        }
    }

    /// Dispatch one JSON-RPC request value.
    ///
    /// Returns `None` only for notifications (no `id`, nothing to answer);
    /// every other input — including malformed ones — yields a well-formed
    /// response or error object.
    pub async fn handle_jsonrpc(&self, request: Value) -> Option<Value> {
        let Some(obj) = request.as_object() else {
            return Some(error_response(
                Value::Null,
                INVALID_REQUEST,
                "request must be an object",
            ));
        };

        let id = obj.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            return Some(error_response(id, INVALID_REQUEST, "missing method"));
        };
        let params = obj.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => Some(success_response(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": self.version },
                }),
            )),
            "ping" => Some(success_response(id, json!({}))),
            "tools/list" => Some(success_response(
                id,
                json!({ "tools": self.list_tools().await }),
            )),
            "tools/call" => Some(self.handle_call(id, &params).await),
            other if other.starts_with("notifications/") => {
                debug!(method = other, "tool router: notification acknowledged");
                None
            }
            other => Some(error_response(
                id,
                METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            )),
        }
    }

    async fn handle_call(&self, id: Value, params: &Value) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return error_response(id, INVALID_PARAMS, "tools/call requires a tool name");
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        match self.call_tool(name, arguments).await {
            Ok(output) => success_response(id, call_result(&output)),
            Err(AgentError::ToolNotFound(name)) => {
                error_response(id, INVALID_PARAMS, &format!("unknown tool: {name}"))
            }
            Err(err) => {
                // Tool failures are displayable results, not transport errors.
                warn!(tool = name, error = %err, "tool router: handler failed");
                success_response(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": err.message() }],
                        "is_error": true,
                    }),
                )
            }
        }
    }
}

/// Shape a successful handler output into a call-tool result.
///
/// Handlers returning an object that already carries `content` are passed
/// through (gaining `is_error: false` if absent); anything else becomes a
/// single text content item.
fn call_result(output: &Value) -> Value {
    if let Some(obj) = output.as_object() {
        if obj.contains_key("content") {
            let mut obj = obj.clone();
            obj.entry("is_error").or_insert(Value::Bool(false));
            return Value::Object(obj);
        }
    }
    let text = match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "is_error": false,
    })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}
