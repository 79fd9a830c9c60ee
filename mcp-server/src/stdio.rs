//! STDIO Transport for MCP Server
//!
//! Line-delimited JSON-RPC 2.0 over stdin/stdout with the
//! initialize/initialized handshake. The whole process is one connection with
//! a random id, so a user who logs in through the browser stays bound to it
//! until exit.

use anyhow::{Context, Result};
use expense_core::{CallerContext, Dispatcher};
use mcp_protocol::{McpError, McpRouter};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// MCP protocol state tracking
#[derive(Debug, PartialEq)]
enum McpState {
    /// Waiting for initialize request from client
    WaitingForInitialize,
    /// Initialize request received, sent response, waiting for initialized notification
    WaitingForInitialized,
    /// Fully initialized and ready to process requests
    Ready,
}

/// STDIO MCP Server with protocol state management
pub struct StdioMcpServer {
    router: McpRouter,
    caller: CallerContext,
    state: McpState,
}

impl StdioMcpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_connection_id(dispatcher, format!("stdio-{}", Uuid::new_v4()))
    }

    pub fn connection_id(&self) -> &str {
        &self.caller.connection_id
    }

    pub fn with_connection_id(dispatcher: Arc<Dispatcher>, connection_id: impl Into<String>) -> Self {
        Self {
            router: McpRouter::new(dispatcher),
            caller: CallerContext::new(connection_id),
            state: McpState::WaitingForInitialize,
        }
    }

    /// Serve on the process stdin/stdout until stdin closes
    pub async fn serve(self) -> Result<()> {
        self.serve_io(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve on arbitrary streams until the reader reaches EOF
    pub async fn serve_io<R, W>(mut self, input: R, mut output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!(
            connection_id = %self.caller.connection_id,
            "Starting MCP server in STDIO mode - waiting for initialize request"
        );

        let mut reader = BufReader::new(input);
        let mut line = String::new();

        loop {
            line.clear();

            let read = reader
                .read_line(&mut line)
                .await
                .context("Error reading from stdin")?;
            if read == 0 {
                info!("STDIN closed, shutting down MCP server");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(bytes = trimmed.len(), "Received line");

            if let Some(response) = self.process_line(trimmed).await {
                let response_json = serde_json::to_string(&response)
                    .context("Failed to serialize JSON-RPC response")?;

                output
                    .write_all(response_json.as_bytes())
                    .await
                    .context("Failed to write response to stdout")?;
                output
                    .write_all(b"\n")
                    .await
                    .context("Failed to write newline to stdout")?;
                output.flush().await.context("Failed to flush stdout")?;
            }
        }

        info!("STDIO MCP server shutdown complete");
        Ok(())
    }

    /// Process one line; `None` when nothing is sent back
    async fn process_line(&mut self, line: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse JSON-RPC message");
                return Some(McpError::Parse(e.to_string()).to_json_rpc_error(None));
            }
        };
        let id = message.get("id").cloned();

        match self.process_message(message).await {
            Ok(response) => response,
            Err(e) if id.is_none() => {
                warn!(error = %e, "Dropping invalid notification");
                None
            }
            Err(e) => Some(e.to_json_rpc_error(id)),
        }
    }

    async fn process_message(&mut self, message: Value) -> Result<Option<Value>, McpError> {
        if message.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(McpError::Protocol("Invalid JSON-RPC version".to_string()));
        }
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::Protocol("Missing or invalid 'method' field".to_string()))?;

        let id = message.get("id").cloned();
        let is_notification = id.is_none();

        match (&self.state, method) {
            (McpState::WaitingForInitialize, "initialize") => {
                if is_notification {
                    return Err(McpError::Protocol(
                        "Initialize must be a request, not a notification".to_string(),
                    ));
                }

                info!("Received initialize request");
                self.state = McpState::WaitingForInitialized;

                let params = message.get("params").cloned().unwrap_or(Value::Null);
                Ok(Some(json!({
                    "jsonrpc": "2.0",
                    "result": self.router.initialize_result(&params),
                    "id": id
                })))
            }

            (McpState::WaitingForInitialized, "notifications/initialized") => {
                if !is_notification {
                    return Err(McpError::Protocol(
                        "Initialized must be a notification, not a request".to_string(),
                    ));
                }

                info!("Received initialized notification - server is ready");
                self.state = McpState::Ready;
                Ok(None)
            }

            (_, "ping") | (McpState::Ready, _) => {
                Ok(self.router.handle(&message, &self.caller).await)
            }

            _ => Err(McpError::Protocol(format!(
                "Invalid method '{}' for current state {:?}",
                method, self.state
            ))),
        }
    }
}
