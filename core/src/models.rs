use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Service-level bearer token obtained through the backend password grant.
///
/// Owned by the [`BackendTokenManager`](crate::token_manager::BackendTokenManager);
/// handlers only ever see clones. The `Debug` impl never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceToken {
    value: String,
    pub obtained_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ServiceToken {
    pub fn new(value: impl Into<String>, obtained_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            obtained_at,
            expires_at,
        }
    }

    /// Raw bearer value, for building an `Authorization` header
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// A token is usable only while `now + margin < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }
}

impl fmt::Debug for ServiceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceToken")
            .field("value", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Reported lifetimes above this are clamped
pub const MAX_TOKEN_LIFETIME_DAYS: i64 = 365;

/// Raw result of a token endpoint call, before expiry is resolved.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Lifetime in seconds, if the endpoint reported one
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Resolve the absolute expiry, falling back to `default_lifetime`
    ///
    /// Negative lifetimes resolve to `now`; lifetimes above
    /// [`MAX_TOKEN_LIFETIME_DAYS`] are clamped. `None` when the result is
    /// not representable.
    pub fn expires_at(&self, now: DateTime<Utc>, default_lifetime: Duration) -> Option<DateTime<Utc>> {
        let max_lifetime = Duration::days(MAX_TOKEN_LIFETIME_DAYS);
        let lifetime = match self.expires_in {
            Some(secs) => Duration::try_seconds(secs.clamp(0, max_lifetime.num_seconds()))?,
            None => default_lifetime.min(max_lifetime),
        };
        now.checked_add_signed(lifetime)
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// User-level OAuth identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Microsoft,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Microsoft => "microsoft",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::error::ExpenseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "microsoft" | "azure" | "entra" => Ok(Provider::Microsoft),
            "google" => Ok(Provider::Google),
            other => Err(crate::error::ExpenseError::Configuration(format!(
                "Unknown OAuth provider: '{other}'"
            ))),
        }
    }
}

/// Claim keys extracted from provider identity information
pub mod claims {
    pub const SUBJECT: &str = "sub";
    pub const EMAIL: &str = "email";
    pub const NAME: &str = "name";
}

/// Per-user OAuth session, keyed by `user_id` in the session store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
}

impl UserSession {
    /// Valid only while `now < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        self.claims.get(claims::EMAIL).map(String::as_str)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.claims.get(claims::NAME).map(String::as_str)
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("claims", &self.claims)
            .finish()
    }
}

/// A login flow that has been started but not yet completed.
///
/// Consumed exactly once by the matching authorization code exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub provider: Provider,
    pub created_at: DateTime<Utc>,
    pub pkce_verifier: String,
    pub redirect_uri: String,
    /// Connection that started the login, bound to the user once it completes
    pub connection_id: Option<String>,
}

impl PendingAuthorization {
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now >= self.created_at + ttl
    }
}

impl fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("provider", &self.provider)
            .field("created_at", &self.created_at)
            .field("pkce_verifier", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Identity of the party invoking a tool, supplied by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerContext {
    /// Opaque per-connection identifier
    pub connection_id: String,
    /// Authenticated user, once the connection completed a login
    pub user_id: Option<String>,
}

impl CallerContext {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Expense report as returned to tool callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Report {
    pub id: String,
    pub name: Option<String>,
    pub purpose: Option<String>,
    pub business_purpose: Option<String>,
    pub total: Option<f64>,
    pub currency_code: Option<String>,
    pub submission_date: Option<String>,
    pub approval_status: Option<String>,
    pub workflow_step: Option<String>,
    pub owner_name: Option<String>,
    pub created_date: Option<String>,
    pub last_modified_date: Option<String>,
    pub country: Option<String>,
    pub policy_id: Option<String>,
    pub report_version: Option<String>,
}

/// Single expense entry within a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExpenseEntry {
    pub id: String,
    pub report_id: Option<String>,
    pub expense_type: Option<String>,
    pub transaction_amount: Option<f64>,
    pub transaction_currency_code: Option<String>,
    pub transaction_date: Option<String>,
    pub business_purpose: Option<String>,
    pub vendor_description: Option<String>,
    pub city_name: Option<String>,
    pub country_code: Option<String>,
    pub payment_type: Option<String>,
    pub receipt_required: Option<bool>,
    pub has_receipt: Option<bool>,
}

/// Payment method that expense entries can be charged to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PaymentType {
    pub id: Option<String>,
    pub code: Option<String>,
    pub name: Option<String>,
}

/// Expense type available to the company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExpenseType {
    pub code: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub expense_type_id: Option<String>,
}
