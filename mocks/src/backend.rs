//! Mock implementations of the backend traits
//!
//! [`MockExpenseBackend`] serves canned reports and records every call with
//! the bearer token it was given. [`MockTokenEndpoint`] issues numbered
//! service tokens (`svc-1`, `svc-2`, ...) and counts password grants.

use async_trait::async_trait;
use expense_core::{
    clamp_limit, ExpenseBackend, ExpenseEntry, ExpenseError, ExpenseType, PaymentType, Report,
    Result, ServiceToken, TokenEndpoint, TokenGrant,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock implementation of ExpenseBackend for testing
///
/// Features:
/// - Error injection, consumed in FIFO order one per call
/// - Tokens that are answered with `Unauthorized`, to simulate server-side revocation
/// - Call history and per-call bearer token tracking
#[derive(Clone, Default)]
pub struct MockExpenseBackend {
    reports: Arc<Mutex<Vec<Report>>>,
    expenses: Arc<Mutex<HashMap<String, Vec<ExpenseEntry>>>>,
    expense_types: Arc<Mutex<Vec<ExpenseType>>>,
    payment_types: Arc<Mutex<Vec<PaymentType>>>,
    refuse_connection_check: Arc<AtomicBool>,
    error_queue: Arc<Mutex<VecDeque<ExpenseError>>>,
    revoked_tokens: Arc<Mutex<HashSet<String>>>,
    call_history: Arc<Mutex<Vec<String>>>,
    tokens_seen: Arc<Mutex<Vec<String>>>,
}

impl MockExpenseBackend {
    /// Create an empty mock backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock backend serving the given reports
    pub fn with_reports(reports: Vec<Report>) -> Self {
        let backend = Self::new();
        *backend.reports.lock() = reports;
        backend
    }

    pub fn set_expenses(&self, report_id: &str, entries: Vec<ExpenseEntry>) {
        self.expenses.lock().insert(report_id.to_string(), entries);
    }

    pub fn set_expense_types(&self, types: Vec<ExpenseType>) {
        *self.expense_types.lock() = types;
    }

    pub fn set_payment_types(&self, types: Vec<PaymentType>) {
        *self.payment_types.lock() = types;
    }

    /// Make the connectivity check answer `Ok(false)`
    pub fn refuse_connection_check(&self, refuse: bool) {
        self.refuse_connection_check.store(refuse, Ordering::SeqCst);
    }

    /// Inject an error for the next call
    pub fn inject_error(&self, error: ExpenseError) {
        self.error_queue.lock().push_back(error);
    }

    /// Clear pending error injections
    pub fn clear_errors(&self) {
        self.error_queue.lock().clear();
    }

    /// Answer every call made with `token` with `Unauthorized`
    pub fn revoke_token(&self, token: &str) {
        self.revoked_tokens.lock().insert(token.to_string());
    }

    /// Get history of called methods
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }

    /// Number of calls to `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.call_history
            .lock()
            .iter()
            .filter(|call| call.starts_with(&format!("{method}(")))
            .count()
    }

    /// Bearer tokens presented, in call order
    pub fn tokens_seen(&self) -> Vec<String> {
        self.tokens_seen.lock().clone()
    }

    /// Clear call history and token tracking
    pub fn clear_history(&self) {
        self.call_history.lock().clear();
        self.tokens_seen.lock().clear();
    }

    /// Assert method was called
    pub fn assert_called(&self, method: &str) {
        assert!(
            self.call_count(method) > 0,
            "Method '{}' was not called. Call history: {:?}",
            method,
            self.call_history()
        );
    }

    /// Assert the backend was never reached
    pub fn assert_not_called(&self) {
        let history = self.call_history();
        assert!(history.is_empty(), "Backend was called: {history:?}");
    }

    /// Record the call, then apply injected errors and revoked tokens
    fn enter(&self, method: &str, params: &str, token: &ServiceToken) -> Result<()> {
        self.call_history.lock().push(format!("{method}({params})"));
        self.tokens_seen.lock().push(token.secret().to_string());

        if let Some(error) = self.error_queue.lock().pop_front() {
            return Err(error);
        }
        if self.revoked_tokens.lock().contains(token.secret()) {
            return Err(ExpenseError::Unauthorized);
        }
        Ok(())
    }
}

#[async_trait]
impl ExpenseBackend for MockExpenseBackend {
    async fn list_reports(&self, token: &ServiceToken, limit: u32) -> Result<Vec<Report>> {
        self.enter("list_reports", &format!("limit={limit}"), token)?;
        let limit = clamp_limit(limit) as usize;
        Ok(self.reports.lock().iter().take(limit).cloned().collect())
    }

    async fn get_report(&self, token: &ServiceToken, report_id: &str) -> Result<Report> {
        self.enter("get_report", &format!("id={report_id}"), token)?;
        self.reports
            .lock()
            .iter()
            .find(|r| r.id == report_id)
            .cloned()
            .ok_or_else(|| {
                ExpenseError::BackendRejected(format!("404 Not Found: Report {report_id} not found"))
            })
    }

    async fn check_connection(&self, token: &ServiceToken) -> Result<bool> {
        self.enter("check_connection", "", token)?;
        Ok(!self.refuse_connection_check.load(Ordering::SeqCst))
    }

    async fn list_expenses(
        &self,
        token: &ServiceToken,
        report_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExpenseEntry>> {
        self.enter(
            "list_expenses",
            &format!("report_id={report_id}, limit={limit}, offset={offset}"),
            token,
        )?;
        let limit = clamp_limit(limit) as usize;
        Ok(self
            .expenses
            .lock()
            .get(report_id)
            .map(|entries| {
                entries
                    .iter()
                    .skip(offset as usize)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_expense(&self, token: &ServiceToken, expense_id: &str) -> Result<ExpenseEntry> {
        self.enter("get_expense", &format!("id={expense_id}"), token)?;
        self.expenses
            .lock()
            .values()
            .flatten()
            .find(|e| e.id == expense_id)
            .cloned()
            .ok_or_else(|| {
                ExpenseError::BackendRejected(format!(
                    "404 Not Found: Expense {expense_id} not found"
                ))
            })
    }

    async fn get_expense_types(&self, token: &ServiceToken) -> Result<Vec<ExpenseType>> {
        self.enter("get_expense_types", "", token)?;
        Ok(self.expense_types.lock().clone())
    }

    async fn get_payment_types(&self, token: &ServiceToken) -> Result<Vec<PaymentType>> {
        self.enter("get_payment_types", "", token)?;
        Ok(self.payment_types.lock().clone())
    }
}

/// Mock password-grant endpoint issuing `svc-<n>` tokens
#[derive(Clone, Default)]
pub struct MockTokenEndpoint {
    grants: Arc<AtomicUsize>,
    expires_in: Arc<Mutex<Option<i64>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    error_queue: Arc<Mutex<VecDeque<ExpenseError>>>,
}

impl MockTokenEndpoint {
    /// Endpoint issuing one-hour tokens
    pub fn new() -> Self {
        Self::with_lifetime(Some(3600))
    }

    /// Endpoint reporting `expires_in` as given (`None` omits the field)
    pub fn with_lifetime(expires_in: Option<i64>) -> Self {
        let endpoint = Self::default();
        *endpoint.expires_in.lock() = expires_in;
        endpoint
    }

    /// Delay every grant, to widen race windows in concurrency tests
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn set_lifetime(&self, expires_in: Option<i64>) {
        *self.expires_in.lock() = expires_in;
    }

    /// Inject an error for the next grant
    pub fn inject_error(&self, error: ExpenseError) {
        self.error_queue.lock().push_back(error);
    }

    /// Number of password grants performed, including failed ones
    pub fn grant_count(&self) -> usize {
        self.grants.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for MockTokenEndpoint {
    async fn password_grant(&self) -> Result<TokenGrant> {
        let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let injected = self.error_queue.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        Ok(TokenGrant {
            access_token: format!("svc-{n}"),
            refresh_token: None,
            id_token: None,
            expires_in: *self.expires_in.lock(),
        })
    }
}
