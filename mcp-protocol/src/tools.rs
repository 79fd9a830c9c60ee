//! Expense tools exposed over MCP
//!
//! Each tool is a small [`ToolHandler`] that parses its arguments, calls the
//! service-authenticated backend and shapes the JSON result. Credential
//! resolution happens in the [`Dispatcher`](expense_core::Dispatcher) before a
//! handler runs, so protected handlers can rely on `ctx.session`.

use async_trait::async_trait;
use expense_core::{
    clamp_limit, validate_id, ExpenseError, Result, ToolContext, ToolDescriptor, ToolHandler,
    ToolRegistry, ToolVisibility, UserSession,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Page size used when a caller omits `limit`
pub const DEFAULT_LIMIT: u32 = 25;

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListReportsArgs {
    #[serde(default = "default_limit")]
    limit: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportArgs {
    report_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReportExpensesArgs {
    report_id: String,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpenseArgs {
    expense_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

/// Deserialize tool arguments; a missing or null arguments object counts as `{}`
fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ExpenseError::InvalidArguments(e.to_string()))
}

fn require_session(ctx: &ToolContext) -> Result<&UserSession> {
    ctx.session
        .as_ref()
        .ok_or_else(|| ExpenseError::Internal("protected tool invoked without a session".into()))
}

fn user_summary(session: &UserSession) -> Value {
    json!({
        "user_id": session.user_id,
        "email": session.email(),
        "name": session.display_name(),
    })
}

struct ListReports {
    protected: bool,
}

#[async_trait]
impl ToolHandler for ListReports {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let args: ListReportsArgs = parse_args(args)?;
        let limit = clamp_limit(args.limit);
        let reports = ctx.backend.list_reports(limit).await?;
        debug!(count = reports.len(), limit, "Listed reports");

        let mut result = json!({
            "count": reports.len(),
            "limit": limit,
            "reports": reports,
        });
        if self.protected {
            let session = require_session(ctx)?;
            result["authenticated_user"] = user_summary(session);
        }
        Ok(result)
    }
}

struct GetReportDetails;

#[async_trait]
impl ToolHandler for GetReportDetails {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let args: ReportArgs = parse_args(args)?;
        let report_id = args.report_id.trim();
        validate_id("report_id", report_id)?;
        let report = ctx.backend.get_report(report_id).await?;
        Ok(json!({ "report": report }))
    }
}

struct ListReportExpenses;

#[async_trait]
impl ToolHandler for ListReportExpenses {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let args: ReportExpensesArgs = parse_args(args)?;
        let report_id = args.report_id.trim();
        validate_id("report_id", report_id)?;
        let limit = clamp_limit(args.limit);
        let expenses = ctx
            .backend
            .list_expenses(report_id, limit, args.offset)
            .await?;
        Ok(json!({
            "report_id": report_id,
            "count": expenses.len(),
            "limit": limit,
            "offset": args.offset,
            "expenses": expenses,
        }))
    }
}

struct GetExpenseDetails;

#[async_trait]
impl ToolHandler for GetExpenseDetails {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let args: ExpenseArgs = parse_args(args)?;
        let expense_id = args.expense_id.trim();
        validate_id("expense_id", expense_id)?;
        let expense = ctx.backend.get_expense(expense_id).await?;
        Ok(json!({ "expense": expense }))
    }
}

struct GetExpenseTypes;

#[async_trait]
impl ToolHandler for GetExpenseTypes {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let _: NoArgs = parse_args(args)?;
        let expense_types = ctx.backend.get_expense_types().await?;
        Ok(json!({
            "count": expense_types.len(),
            "expense_types": expense_types,
        }))
    }
}

struct GetPaymentTypes;

#[async_trait]
impl ToolHandler for GetPaymentTypes {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let _: NoArgs = parse_args(args)?;
        let payment_types = ctx.backend.get_payment_types().await?;
        Ok(json!({
            "count": payment_types.len(),
            "payment_types": payment_types,
        }))
    }
}

/// Diagnostic connection check; credential and network failures are reported as data
struct TestConnection;

#[async_trait]
impl ToolHandler for TestConnection {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let _: NoArgs = parse_args(args)?;
        match ctx.backend.check_connection().await {
            Ok(true) => Ok(json!({
                "connected": true,
                "message": "Connected to the expense API",
            })),
            Ok(false) => Ok(json!({
                "connected": false,
                "message": "Expense API reachable but the service account was refused",
            })),
            Err(e @ (ExpenseError::Credential(_) | ExpenseError::TransientNetwork(_))) => {
                Ok(json!({
                    "connected": false,
                    "error_kind": e.kind(),
                    "message": e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }
}

struct GetUserProfile;

#[async_trait]
impl ToolHandler for GetUserProfile {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let _: NoArgs = parse_args(args)?;
        let session = require_session(ctx)?;
        Ok(json!({
            "user": {
                "user_id": session.user_id,
                "provider": session.provider,
                "email": session.email(),
                "name": session.display_name(),
            },
            "expires_at": session.expires_at,
        }))
    }
}

struct OAuthStatus;

#[async_trait]
impl ToolHandler for OAuthStatus {
    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value> {
        let _: NoArgs = parse_args(args)?;
        Ok(match ctx.oauth_provider {
            Some(provider) => json!({
                "oauth_available": true,
                "provider": provider,
                "message": format!(
                    "User login via {provider} is enabled; protected tools return a login URL until you authenticate"
                ),
            }),
            None => json!({
                "oauth_available": false,
                "provider": "none",
                "message": "User login is not configured; only public tools are available",
            }),
        })
    }
}

fn limit_schema() -> Value {
    json!({
        "type": "integer",
        "minimum": 1,
        "maximum": 100,
        "default": DEFAULT_LIMIT,
        "description": "Maximum number of items to return"
    })
}

fn report_id_schema() -> Value {
    json!({
        "type": "string",
        "description": "Expense report ID"
    })
}

fn no_args_schema() -> Value {
    json!({ "type": "object", "properties": {}, "additionalProperties": false })
}

/// Registry with every expense tool
pub fn default_registry() -> Result<ToolRegistry> {
    ToolRegistry::builder()
        .register(ToolDescriptor::new(
            "list_reports_public",
            "List expense reports using the service account (no user login required)",
            ToolVisibility::Public,
            json!({
                "type": "object",
                "properties": { "limit": limit_schema() },
                "additionalProperties": false
            }),
            Arc::new(ListReports { protected: false }),
        ))?
        .register(ToolDescriptor::new(
            "list_reports_protected",
            "List expense reports on behalf of the logged-in user",
            ToolVisibility::Protected,
            json!({
                "type": "object",
                "properties": { "limit": limit_schema() },
                "additionalProperties": false
            }),
            Arc::new(ListReports { protected: true }),
        ))?
        .register(ToolDescriptor::new(
            "get_report_details",
            "Get the details of a single expense report",
            ToolVisibility::Public,
            json!({
                "type": "object",
                "properties": { "report_id": report_id_schema() },
                "required": ["report_id"],
                "additionalProperties": false
            }),
            Arc::new(GetReportDetails),
        ))?
        .register(ToolDescriptor::new(
            "list_report_expenses",
            "List the expense entries of a report",
            ToolVisibility::Public,
            json!({
                "type": "object",
                "properties": {
                    "report_id": report_id_schema(),
                    "limit": limit_schema(),
                    "offset": {
                        "type": "integer",
                        "minimum": 0,
                        "default": 0,
                        "description": "Number of entries to skip"
                    }
                },
                "required": ["report_id"],
                "additionalProperties": false
            }),
            Arc::new(ListReportExpenses),
        ))?
        .register(ToolDescriptor::new(
            "get_expense_details",
            "Get a single expense entry",
            ToolVisibility::Public,
            json!({
                "type": "object",
                "properties": {
                    "expense_id": { "type": "string", "description": "Expense entry ID" }
                },
                "required": ["expense_id"],
                "additionalProperties": false
            }),
            Arc::new(GetExpenseDetails),
        ))?
        .register(ToolDescriptor::new(
            "get_expense_types",
            "List the expense types configured for the company",
            ToolVisibility::Public,
            no_args_schema(),
            Arc::new(GetExpenseTypes),
        ))?
        .register(ToolDescriptor::new(
            "get_payment_types",
            "List the payment types configured for the company",
            ToolVisibility::Public,
            no_args_schema(),
            Arc::new(GetPaymentTypes),
        ))?
        .register(ToolDescriptor::new(
            "test_connection",
            "Check connectivity and credentials against the expense API",
            ToolVisibility::Public,
            no_args_schema(),
            Arc::new(TestConnection),
        ))?
        .register(ToolDescriptor::new(
            "get_user_profile",
            "Show the identity of the logged-in user",
            ToolVisibility::Protected,
            no_args_schema(),
            Arc::new(GetUserProfile),
        ))?
        .register(ToolDescriptor::new(
            "oauth_status",
            "Report whether user login is configured and which provider is used",
            ToolVisibility::Public,
            no_args_schema(),
            Arc::new(OAuthStatus),
        ))
        .map(|builder| builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_contents() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 10);

        let protected: Vec<_> = registry
            .descriptors()
            .filter(|d| d.is_protected())
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(protected, vec!["get_user_profile", "list_reports_protected"]);
    }

    #[test]
    fn test_parse_args_defaults() {
        let args: ListReportsArgs = parse_args(Value::Null).unwrap();
        assert_eq!(args.limit, DEFAULT_LIMIT);

        let args: ListReportsArgs = parse_args(json!({"limit": 5})).unwrap();
        assert_eq!(args.limit, 5);

        let args: ReportExpensesArgs = parse_args(json!({"report_id": "R1"})).unwrap();
        assert_eq!((args.limit, args.offset), (DEFAULT_LIMIT, 0));
    }

    #[test]
    fn test_parse_args_rejects_bad_input() {
        let err = parse_args::<ListReportsArgs>(json!({"limit": -1})).unwrap_err();
        assert!(matches!(err, ExpenseError::InvalidArguments(_)));

        let err = parse_args::<ReportArgs>(json!({})).unwrap_err();
        assert!(err.to_string().contains("report_id"));

        let err = parse_args::<NoArgs>(json!({"unexpected": true})).unwrap_err();
        assert!(matches!(err, ExpenseError::InvalidArguments(_)));
    }
}
