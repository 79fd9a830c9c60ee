//! Structured request logging middleware for the MCP HTTP endpoint
//!
//! Emits one `tracing` event per JSON-RPC request with the method, the tool
//! name for `tools/call`, the elapsed time and a truncated, redacted summary
//! of the arguments.

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::LengthLimitError;
use serde_json::{json, Value};
use std::error::Error as _;
use std::time::Instant;
use tracing::{info, warn};

/// Largest MCP request body read before the request is refused
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Maximum length for parameter values before truncation
const MAX_PARAM_LENGTH: usize = 30;

/// Truncation suffix for long parameters
const TRUNCATION_SUFFIX: &str = "...";

/// Keys whose values never reach the logs
const SENSITIVE_KEYS: [&str; 9] = [
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "credential",
    "code",
    "state",
    "verifier",
];

/// MCP request logging middleware
pub async fn mcp_request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    if !request.uri().path().starts_with("/mcp") {
        return next.run(request).await;
    }

    let start_time = Instant::now();
    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let too_large = e.source().is_some_and(|source| source.is::<LengthLimitError>());
            warn!(error = %e, too_large, "Failed to read MCP request body");
            let (status, message) = if too_large {
                (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large")
            } else {
                (StatusCode::BAD_REQUEST, "Request body could not be read")
            };
            let error = json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32600, "message": message }
            });
            return (status, Json(error)).into_response();
        }
    };

    let (method, tool, params_summary) = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(json) => summarize_request(&json),
        Err(_) => ("invalid_json".to_string(), None, String::new()),
    };

    let response = next
        .run(Request::from_parts(parts, Body::from(body_bytes)))
        .await;

    info!(
        method = %method,
        tool = tool.as_deref().unwrap_or("-"),
        status = response.status().as_u16(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        params = %params_summary,
        "MCP request"
    );
    response
}

/// Method name, tool name and argument summary of a JSON-RPC message
fn summarize_request(json: &Value) -> (String, Option<String>, String) {
    let method = json
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let params = json.get("params").unwrap_or(&Value::Null);

    if method == "tools/call" {
        let tool = params.get("name").and_then(Value::as_str).map(str::to_string);
        let arguments = params.get("arguments").unwrap_or(&Value::Null);
        return (method, tool, format_params_summary(arguments));
    }
    (method, None, format_params_summary(params))
}

/// Format parameters into a summary string with truncation
fn format_params_summary(params: &Value) -> String {
    match params {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                if is_sensitive_parameter(key) {
                    format!("{key}=\"[REDACTED]\"")
                } else {
                    format!("{key}=\"{}\"", format_parameter_value(value))
                }
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Array(arr) => format!("[{} items]", arr.len()),
        Value::Null => String::new(),
        _ => format_parameter_value(params),
    }
}

/// Format a single parameter value with truncation
fn format_parameter_value(value: &Value) -> String {
    let value_str = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(arr) => format!("[{} items]", arr.len()),
        Value::Object(obj) => format!("{{...{} fields}}", obj.len()),
        Value::Null => "null".to_string(),
    };

    truncate_string(&value_str, MAX_PARAM_LENGTH)
}

/// Truncate to `max_length` characters, suffix included
fn truncate_string(input: &str, max_length: usize) -> String {
    if input.chars().count() <= max_length {
        return input.to_string();
    }
    let keep = max_length.saturating_sub(TRUNCATION_SUFFIX.len());
    let mut truncated: String = input.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_SUFFIX);
    truncated
}

/// Check if parameter should be redacted for security
fn is_sensitive_parameter(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    SENSITIVE_KEYS
        .iter()
        .any(|&sensitive| key_lower.contains(sensitive))
}
