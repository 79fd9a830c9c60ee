//! Standard test fixtures for consistent testing
//!
//! Provides pre-built test data including:
//! - Expense reports, entries, expense types and payment types shaped like backend responses
//! - Valid, expired and unrefreshable user sessions
//! - Service tokens

use chrono::{Duration, Utc};
use expense_core::{
    ExpenseEntry, ExpenseType, PaymentType, Provider, Report, ServiceToken, UserSession,
};
use std::collections::BTreeMap;

/// Create a basic test report with sensible defaults
pub fn create_test_report(id: &str) -> Report {
    Report {
        id: id.to_string(),
        name: Some(format!("Report {id}")),
        purpose: Some("Customer visit".to_string()),
        total: Some(1250.75),
        currency_code: Some("USD".to_string()),
        approval_status: Some("Submitted".to_string()),
        owner_name: Some("Test Owner".to_string()),
        created_date: Some("2024-03-01T09:00:00".to_string()),
        ..Report::default()
    }
}

/// Create multiple reports with ids `RPT-001`, `RPT-002`, ...
pub fn create_test_reports(count: usize) -> Vec<Report> {
    (1..=count)
        .map(|i| {
            let mut report = create_test_report(&format!("RPT-{i:03}"));
            report.total = Some(100.0 * i as f64);
            report
        })
        .collect()
}

/// Create an expense entry belonging to `report_id`
pub fn create_test_expense(report_id: &str, index: usize) -> ExpenseEntry {
    ExpenseEntry {
        id: format!("{report_id}-E{index}"),
        report_id: Some(report_id.to_string()),
        expense_type: Some("Airfare".to_string()),
        transaction_amount: Some(42.0 * index as f64),
        transaction_currency_code: Some("EUR".to_string()),
        transaction_date: Some("2024-03-02".to_string()),
        city_name: Some("Berlin".to_string()),
        has_receipt: Some(true),
        ..ExpenseEntry::default()
    }
}

/// A small company expense-type catalogue
pub fn create_test_expense_types() -> Vec<ExpenseType> {
    [
        ("AIRFR", "Airfare", "TRAVEL"),
        ("LODNG", "Hotel", "LODGING"),
        ("MEALS", "Meals", "MEALS"),
    ]
    .iter()
    .enumerate()
    .map(|(i, (code, name, category))| ExpenseType {
        code: Some(code.to_string()),
        name: Some(name.to_string()),
        category: Some(category.to_string()),
        expense_type_id: Some((i + 1).to_string()),
    })
    .collect()
}

/// Cash and company card payment types
pub fn create_test_payment_types() -> Vec<PaymentType> {
    [("CASH", "Cash"), ("CBCP", "Company Paid Card")]
        .iter()
        .enumerate()
        .map(|(i, (code, name))| PaymentType {
            id: Some(format!("PT{}", i + 1)),
            code: Some(code.to_string()),
            name: Some(name.to_string()),
        })
        .collect()
}

/// Service token valid for one hour
pub fn service_token(value: &str) -> ServiceToken {
    let now = Utc::now();
    ServiceToken::new(value, now, now + Duration::hours(1))
}

fn provider_of(user_id: &str) -> Provider {
    user_id
        .split_once(':')
        .and_then(|(prefix, _)| prefix.parse().ok())
        .unwrap_or(Provider::Microsoft)
}

/// Session valid for one hour, with a refresh token and email/name claims
pub fn create_valid_session(user_id: &str) -> UserSession {
    let local = user_id.rsplit(':').next().unwrap_or(user_id);
    let mut claims = BTreeMap::new();
    claims.insert("email".to_string(), format!("{local}@example.test"));
    claims.insert("name".to_string(), format!("User {local}"));
    UserSession {
        user_id: user_id.to_string(),
        provider: provider_of(user_id),
        access_token: format!("access-{local}"),
        refresh_token: Some(format!("refresh-{local}")),
        expires_at: Utc::now() + Duration::hours(1),
        claims,
    }
}

/// Session that expired a minute ago
pub fn create_expired_session(user_id: &str, refreshable: bool) -> UserSession {
    let mut session = create_valid_session(user_id);
    session.expires_at = Utc::now() - Duration::minutes(1);
    if !refreshable {
        session.refresh_token = None;
    }
    session
}
