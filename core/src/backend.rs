use crate::{
    error::{ExpenseError, Result},
    models::{ExpenseEntry, ExpenseType, PaymentType, Report, ServiceToken, TokenGrant},
};
use async_trait::async_trait;

/// Smallest and largest page size accepted by the expense backend
pub const MIN_LIMIT: u32 = 1;
pub const MAX_LIMIT: u32 = 100;

/// Clamp a requested page size into `MIN_LIMIT..=MAX_LIMIT`
pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(MIN_LIMIT, MAX_LIMIT)
}

/// Check an id that will be interpolated into a backend URL path
pub fn validate_id(name: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ExpenseError::missing_argument(name));
    }
    if id.contains(['/', '\\', '?', '#']) || id.contains("..") {
        return Err(ExpenseError::InvalidArguments(format!(
            "Argument '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Operations of the backend expense API.
///
/// Every call carries the current service token as a bearer credential.
/// Implementations must be thread-safe and map transport failures onto the
/// shared error taxonomy:
///
/// * `Err(ExpenseError::Unauthorized)` - backend rejected the bearer token
/// * `Err(ExpenseError::TransientNetwork)` - timeout, connect failure, 429 or 5xx
/// * `Err(ExpenseError::BackendRejected)` - domain-level rejection (unknown id, bad filter)
#[async_trait]
pub trait ExpenseBackend: Send + Sync {
    /// List at most `limit` reports (limit is clamped to 1..=100)
    async fn list_reports(&self, token: &ServiceToken, limit: u32) -> Result<Vec<Report>>;

    /// Fetch a single report by id
    async fn get_report(&self, token: &ServiceToken, report_id: &str) -> Result<Report>;

    /// Lightweight connectivity check
    ///
    /// # Returns
    /// * `Ok(true)` - backend reachable and token accepted
    /// * `Ok(false)` - backend reachable but the check was refused
    async fn check_connection(&self, token: &ServiceToken) -> Result<bool>;

    /// List expense entries belonging to a report, skipping the first `offset`
    async fn list_expenses(
        &self,
        token: &ServiceToken,
        report_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExpenseEntry>>;

    /// Fetch a single expense entry by id
    async fn get_expense(&self, token: &ServiceToken, expense_id: &str) -> Result<ExpenseEntry>;

    /// Expense types configured for the company
    async fn get_expense_types(&self, token: &ServiceToken) -> Result<Vec<ExpenseType>>;

    /// Payment types configured for the company
    async fn get_payment_types(&self, token: &ServiceToken) -> Result<Vec<PaymentType>>;
}

/// Backend token endpoint performing the resource-owner password grant.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange the configured client and resource-owner credentials for a token
    ///
    /// # Returns
    /// * `Err(ExpenseError::Credential)` - client or user credentials rejected
    /// * `Err(ExpenseError::TransientNetwork)` - endpoint unreachable or timed out
    async fn password_grant(&self) -> Result<TokenGrant>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(5), 5);
        assert_eq!(clamp_limit(100), 100);
        assert_eq!(clamp_limit(1000), 100);
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("report_id", "ABC123").is_ok());
        assert_eq!(
            validate_id("report_id", " ").unwrap_err(),
            ExpenseError::missing_argument("report_id")
        );
        assert!(validate_id("report_id", "../admin").is_err());
        assert!(validate_id("report_id", "a/b").is_err());
        assert!(validate_id("report_id", "a\\b").is_err());
        assert!(validate_id("report_id", "a?x=1").is_err());
    }
}
