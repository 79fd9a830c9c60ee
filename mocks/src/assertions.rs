//! Custom assertion helpers for testing
//!
//! Provides specialized assertions for:
//! - Tool error kinds and login URLs
//! - Secret material leaking into caller-visible text
//! - Report collections

use expense_core::{ErrorKind, Report, ToolError};
use serde_json::Value;

/// Assert a tool invocation failed with the given kind
pub fn assert_tool_error_kind(result: &Result<Value, ToolError>, expected: ErrorKind) {
    match result {
        Err(err) => assert_eq!(
            err.kind, expected,
            "Tool failed with {:?} ({}), expected {:?}",
            err.kind, err.message, expected
        ),
        Ok(value) => panic!("Expected {expected:?} error, tool succeeded with {value}"),
    }
}

/// Assert the invocation asked for authentication and return the login URL
pub fn assert_authentication_required(result: &Result<Value, ToolError>) -> String {
    assert_tool_error_kind(result, ErrorKind::AuthenticationRequired);
    match result {
        Err(ToolError {
            login_url: Some(url),
            ..
        }) => url.clone(),
        other => panic!("AuthenticationRequired without a login URL: {other:?}"),
    }
}

/// Assert none of `secrets` appears in `text`
pub fn assert_no_secrets(text: &str, secrets: &[&str]) {
    for secret in secrets {
        assert!(
            !text.contains(secret),
            "Secret material {secret:?} leaked into: {text}"
        );
    }
}

/// Assert the reports have exactly these ids, in order
pub fn assert_report_ids(reports: &[Report], expected: &[&str]) {
    let actual: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(actual, expected, "Report ids don't match");
}
