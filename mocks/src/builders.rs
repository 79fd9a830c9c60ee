//! Builder pattern implementations for easy test data construction
//!
//! Provides fluent builders for:
//! - User sessions with controllable expiry and refresh capability
//! - Reports with selected fields populated

use chrono::{DateTime, Duration, Utc};
use expense_core::{Provider, Report, UserSession};
use std::collections::BTreeMap;

/// Builder for constructing UserSession instances in tests
pub struct UserSessionBuilder {
    session: UserSession,
}

impl Default for UserSessionBuilder {
    fn default() -> Self {
        Self::new("microsoft:test-user")
    }
}

impl UserSessionBuilder {
    /// Create new builder with a one-hour refreshable session
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            session: UserSession {
                user_id: user_id.into(),
                provider: Provider::Microsoft,
                access_token: "access-token".to_string(),
                refresh_token: Some("refresh-token".to_string()),
                expires_at: Utc::now() + Duration::hours(1),
                claims: BTreeMap::new(),
            },
        }
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.session.provider = provider;
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.session.access_token = token.into();
        self
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.session.refresh_token = Some(token.into());
        self
    }

    pub fn without_refresh_token(mut self) -> Self {
        self.session.refresh_token = None;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.session.expires_at = expires_at;
        self
    }

    /// Expiry relative to now; negative values give an expired session
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.session.expires_at = Utc::now() + Duration::seconds(seconds);
        self
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.session.claims.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> UserSession {
        self.session
    }
}

/// Builder for constructing Report instances in tests
pub struct ReportBuilder {
    report: Report,
}

impl ReportBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            report: Report {
                id: id.into(),
                ..Report::default()
            },
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.report.name = Some(name.into());
        self
    }

    pub fn with_total(mut self, total: f64, currency: impl Into<String>) -> Self {
        self.report.total = Some(total);
        self.report.currency_code = Some(currency.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.report.approval_status = Some(status.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.report.owner_name = Some(owner.into());
        self
    }

    pub fn build(self) -> Report {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_builder() {
        let session = UserSessionBuilder::new("google:x")
            .with_provider(Provider::Google)
            .without_refresh_token()
            .expires_in(-5)
            .with_claim("email", "x@example.test")
            .build();
        assert!(!session.is_refreshable());
        assert!(!session.is_valid_at(Utc::now()));
        assert_eq!(session.email(), Some("x@example.test"));
    }

    #[test]
    fn test_report_builder() {
        let report = ReportBuilder::new("R9")
            .with_name("Quarterly offsite")
            .with_total(10.5, "GBP")
            .build();
        assert_eq!(report.id, "R9");
        assert_eq!(report.currency_code.as_deref(), Some("GBP"));
        assert!(report.approval_status.is_none());
    }
}
