//! Shared reqwest plumbing: client construction, transport error mapping and
//! tolerant JSON field access.

use expense_core::{ExpenseError, Result};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

const USER_AGENT: &str = concat!("expense-mcp/", env!("CARGO_PKG_VERSION"));
const MAX_DETAIL_LEN: usize = 200;

/// Client with request and connect timeouts so no outbound call can hang
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ExpenseError::Configuration(format!("failed to build HTTP client: {e}")))
}

/// Map a reqwest failure onto the error taxonomy. Never includes the URL, which
/// may carry query parameters.
pub fn transport_error(err: reqwest::Error) -> ExpenseError {
    let err = err.without_url();
    if err.is_timeout() {
        ExpenseError::transient("request timed out")
    } else if err.is_connect() || err.is_request() {
        ExpenseError::transient(format!("connection failed: {err}"))
    } else if err.is_decode() {
        ExpenseError::BackendRejected(format!("malformed response: {err}"))
    } else {
        ExpenseError::transient(err.to_string())
    }
}

/// Transient statuses are retried by callers; everything else is final
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Best-effort human-readable message from an error body, truncated
pub fn error_detail(body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["Message", "message", "error_description", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string());
    truncate(&detail, MAX_DETAIL_LEN)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Status mapping for resource endpoints: 401 → `Unauthorized`,
/// 429/5xx → `TransientNetwork`, other failures → `BackendRejected`
pub async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(if status == StatusCode::UNAUTHORIZED {
        ExpenseError::Unauthorized
    } else if is_transient_status(status) {
        ExpenseError::transient(format!("backend returned {status}"))
    } else {
        ExpenseError::BackendRejected(format!("{status}: {}", error_detail(&body)))
    })
}

pub async fn read_json(resp: Response) -> Result<Value> {
    resp.json::<Value>().await.map_err(transport_error)
}

/// String field, accepting numbers as well
pub fn str_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field, accepting numeric strings as well
pub fn f64_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn i64_field(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean field, accepting `"true"`/`"Y"` style strings
pub fn bool_field(v: &Value, key: &str) -> Option<bool> {
    match v.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "y" | "yes" => Some(true),
            "false" | "n" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
