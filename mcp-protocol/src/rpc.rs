//! JSON-RPC method routing shared by the HTTP and stdio transports.

use crate::error::McpError;
use expense_core::{CallerContext, Dispatcher, ToolVisibility};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// MCP protocol revision this server speaks
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Older revision still accepted from clients
pub const LEGACY_PROTOCOL_VERSION: &str = "2025-03-26";

pub const SERVER_NAME: &str = "expense-mcp";

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Routes MCP methods onto the tool [`Dispatcher`].
#[derive(Clone)]
pub struct McpRouter {
    dispatcher: Arc<Dispatcher>,
}

impl McpRouter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle one JSON-RPC message
    ///
    /// # Returns
    /// * `None` - the message was a notification; nothing is sent back
    /// * `Some(response)` - a result or error response carrying the request id
    pub async fn handle(&self, message: &Value, caller: &CallerContext) -> Option<Value> {
        let id = message.get("id").cloned();

        if message.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(McpError::Protocol("Invalid JSON-RPC version".into()).to_json_rpc_error(id));
        }
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return Some(
                McpError::Protocol("Missing or invalid 'method' field".into()).to_json_rpc_error(id),
            );
        };

        if id.is_none() {
            debug!(method, "Received notification");
            return None;
        }

        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let response = match self.execute(method, params, caller).await {
            Ok(result) => json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id
            }),
            Err(e) => e.to_json_rpc_error(id),
        };
        Some(response)
    }

    /// Execute a request method
    pub async fn execute(
        &self,
        method: &str,
        params: Value,
        caller: &CallerContext,
    ) -> Result<Value, McpError> {
        match method {
            "initialize" => Ok(self.initialize_result(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(params, caller).await,
            other => {
                warn!(method = other, "Unsupported MCP method");
                Err(McpError::MethodNotFound(other.to_string()))
            }
        }
    }

    /// Result of the `initialize` handshake
    pub fn initialize_result(&self, params: &Value) -> Value {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = match requested {
            Some(v) if v == LEGACY_PROTOCOL_VERSION => LEGACY_PROTOCOL_VERSION,
            _ => MCP_PROTOCOL_VERSION,
        };
        let instructions = if self.dispatcher.flow().is_configured() {
            "Public tools use the service account. Protected tools require a user login: \
             when one returns an authentication_required error, open its login_url and retry."
        } else {
            "User login is not configured; only public tools are available."
        };
        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": {
                    "listChanged": false
                }
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": instructions
        })
    }

    /// Result of `tools/list`
    pub fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self
            .dispatcher
            .registry()
            .descriptors()
            .map(|d| {
                json!({
                    "name": d.name,
                    "description": d.description,
                    "inputSchema": d.input_schema,
                    "annotations": {
                        "readOnlyHint": true,
                        "requiresUserLogin": d.visibility == ToolVisibility::Protected
                    }
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn call_tool(&self, params: Value, caller: &CallerContext) -> Result<Value, McpError> {
        let params: CallToolParams = serde_json::from_value(params)
            .map_err(|e| McpError::InvalidParams(format!("Invalid tools/call parameters: {e}")))?;

        let value = self
            .dispatcher
            .invoke(&params.name, params.arguments, caller)
            .await?;

        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| McpError::Internal(format!("Failed to serialize tool result: {e}")))?;
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": value,
            "isError": false
        }))
    }
}
