//! Error handling for MCP protocol
//!
//! Maps tool failures and malformed requests to JSON-RPC error codes.

use expense_core::{ErrorKind, ExpenseError, ToolError};
use serde_json::{json, Value};
use thiserror::Error;

/// MCP protocol errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    Protocol(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A tool invocation failed; carries the structured, credential-free error
    #[error("{}", .0.message)]
    Tool(ToolError),
}

impl McpError {
    /// Convert to JSON-RPC error code
    pub fn to_error_code(&self) -> i32 {
        match self {
            McpError::Parse(_) => -32700,
            McpError::Protocol(_) => -32600,
            McpError::MethodNotFound(_) => -32601,
            McpError::InvalidParams(_) => -32602,
            McpError::Internal(_) => -32603,
            McpError::Tool(err) => match err.kind {
                ErrorKind::AuthenticationRequired => -32001,
                ErrorKind::ReAuthenticationRequired => -32002,
                ErrorKind::OauthNotConfigured => -32003,
                ErrorKind::CredentialError => -32004,
                ErrorKind::TransientNetworkError => -32005,
                ErrorKind::BackendRejected => -32006,
                ErrorKind::AuthenticationFailed => -32007,
                ErrorKind::UnknownTool | ErrorKind::InvalidArguments => -32602,
                ErrorKind::InternalError => -32603,
            },
        }
    }

    /// Structured `error.data`, present for tool failures only
    fn data(&self) -> Option<Value> {
        match self {
            McpError::Tool(err) => serde_json::to_value(err).ok(),
            _ => None,
        }
    }

    /// Convert to JSON-RPC error response
    pub fn to_json_rpc_error(&self, id: Option<Value>) -> Value {
        let mut error = json!({
            "code": self.to_error_code(),
            "message": self.to_string()
        });
        if let Some(data) = self.data() {
            error["data"] = data;
        }
        json!({
            "jsonrpc": "2.0",
            "error": error,
            "id": id
        })
    }
}

impl From<ToolError> for McpError {
    fn from(err: ToolError) -> Self {
        McpError::Tool(err)
    }
}

impl From<ExpenseError> for McpError {
    fn from(err: ExpenseError) -> Self {
        McpError::Tool(ToolError::from(err))
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::Parse(err.to_string())
    }
}

/// Convert from anyhow::Error to McpError
impl From<anyhow::Error> for McpError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(mcp_error) = err.downcast_ref::<McpError>() {
            return mcp_error.clone();
        }
        if let Some(json_error) = err.downcast_ref::<serde_json::Error>() {
            return McpError::Parse(json_error.to_string());
        }
        McpError::Protocol(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(McpError::Parse("eof".into()).to_error_code(), -32700);
        assert_eq!(McpError::Protocol("batch".into()).to_error_code(), -32600);
        assert_eq!(
            McpError::MethodNotFound("tasks/list".into()).to_error_code(),
            -32601
        );
        assert_eq!(
            McpError::from(ExpenseError::auth_required(None)).to_error_code(),
            -32001
        );
        assert_eq!(
            McpError::from(ExpenseError::OAuthNotConfigured).to_error_code(),
            -32003
        );
        assert_eq!(
            McpError::from(ExpenseError::UnknownTool("x".into())).to_error_code(),
            -32602
        );
        assert_eq!(
            McpError::from(ExpenseError::Storage("disk".into())).to_error_code(),
            -32603
        );
    }

    #[test]
    fn test_json_rpc_error() {
        let error = McpError::MethodNotFound("resources/list".into());
        let json_error = error.to_json_rpc_error(Some(json!(1)));

        assert_eq!(json_error["jsonrpc"], "2.0");
        assert_eq!(json_error["error"]["code"], -32601);
        assert_eq!(json_error["id"], 1);
        assert!(json_error["error"].get("data").is_none());
    }

    #[test]
    fn test_tool_error_carries_login_url() {
        let error = McpError::from(ExpenseError::auth_required(Some(
            "https://login.example.test/authorize?state=s".into(),
        )));
        let json_error = error.to_json_rpc_error(Some(json!("req-7")));

        assert_eq!(json_error["error"]["code"], -32001);
        assert_eq!(json_error["error"]["data"]["kind"], "authentication_required");
        assert_eq!(
            json_error["error"]["data"]["login_url"],
            "https://login.example.test/authorize?state=s"
        );
        assert_eq!(json_error["id"], "req-7");
    }

    #[test]
    fn test_anyhow_conversion() {
        let parse_err = serde_json::from_str::<Value>("{").unwrap_err();
        let err = McpError::from(anyhow::Error::new(parse_err));
        assert_eq!(err.to_error_code(), -32700);

        let err = McpError::from(anyhow::anyhow!("Invalid JSON-RPC version"));
        assert_eq!(err.to_error_code(), -32600);
    }
}
