use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for expense-server operations
pub type Result<T> = std::result::Result<T, ExpenseError>;

/// Error taxonomy for the dual-authentication tool dispatch core.
///
/// Errors are `Clone` so that a single in-flight refresh can hand the same
/// outcome to every waiter. None of the variants carry credential material;
/// constructors in this crate only ever format identifiers and provider
/// error codes into the messages.
///
/// # Examples
///
/// ```rust
/// use expense_core::error::{ErrorKind, ExpenseError};
///
/// let err = ExpenseError::transient("connection reset");
/// assert!(err.is_retryable());
/// assert_eq!(err.kind(), ErrorKind::TransientNetworkError);
///
/// let err = ExpenseError::auth_required(Some("https://login".to_string()));
/// assert!(err.is_authentication());
/// assert!(!err.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpenseError {
    /// Backend rejected client or resource-owner credentials. Fatal.
    #[error("Credential error: {0}")]
    Credential(String),

    /// Caller must complete an interactive login first
    #[error("Authentication required")]
    AuthenticationRequired { login_url: Option<String> },

    /// A previously valid session can no longer be refreshed
    #[error("Re-authentication required: {0}")]
    ReAuthenticationRequired(String),

    /// No user-level OAuth provider is configured
    #[error("OAuth is not configured; protected tools are unavailable")]
    OAuthNotConfigured,

    /// Connectivity failure or timeout; safe to retry
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Tool name not present in the registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Backend returned a domain-level error
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// Backend answered 401 for the presented bearer token
    #[error("Backend rejected the bearer token")]
    Unauthorized,

    /// Authorization code exchange failed (bad state, expired login, provider refusal)
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Tool arguments did not match the expected shape
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Session persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal system error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, serializable classification of an [`ExpenseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CredentialError,
    AuthenticationRequired,
    ReAuthenticationRequired,
    OauthNotConfigured,
    TransientNetworkError,
    UnknownTool,
    BackendRejected,
    AuthenticationFailed,
    InvalidArguments,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CredentialError => "credential_error",
            ErrorKind::AuthenticationRequired => "authentication_required",
            ErrorKind::ReAuthenticationRequired => "re_authentication_required",
            ErrorKind::OauthNotConfigured => "oauth_not_configured",
            ErrorKind::TransientNetworkError => "transient_network_error",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::BackendRejected => "backend_rejected",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExpenseError {
    /// Create a transient network error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create an authentication-required error carrying an optional login URL
    pub fn auth_required(login_url: Option<String>) -> Self {
        Self::AuthenticationRequired { login_url }
    }

    /// Create a validation error for a missing or empty argument
    pub fn missing_argument(name: &str) -> Self {
        Self::InvalidArguments(format!("Argument '{name}' is required"))
    }

    /// Stable kind used in structured error payloads
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExpenseError::Credential(_) => ErrorKind::CredentialError,
            ExpenseError::AuthenticationRequired { .. } => ErrorKind::AuthenticationRequired,
            ExpenseError::ReAuthenticationRequired(_) => ErrorKind::ReAuthenticationRequired,
            ExpenseError::OAuthNotConfigured => ErrorKind::OauthNotConfigured,
            ExpenseError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            ExpenseError::UnknownTool(_) => ErrorKind::UnknownTool,
            ExpenseError::BackendRejected(_) | ExpenseError::Unauthorized => {
                ErrorKind::BackendRejected
            }
            ExpenseError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            ExpenseError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            ExpenseError::Storage(_)
            | ExpenseError::Configuration(_)
            | ExpenseError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Only network-level failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExpenseError::TransientNetwork(_))
    }

    /// Check if the caller has to (re)authenticate interactively
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ExpenseError::AuthenticationRequired { .. }
                | ExpenseError::ReAuthenticationRequired(_)
                | ExpenseError::AuthenticationFailed(_)
        )
    }

    /// Login URL attached to an authentication-required error
    pub fn login_url(&self) -> Option<&str> {
        match self {
            ExpenseError::AuthenticationRequired { login_url } => login_url.as_deref(),
            _ => None,
        }
    }
}

/// Structured, credential-free error returned to tool callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            login_url: None,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolError {}

impl From<ExpenseError> for ToolError {
    fn from(err: ExpenseError) -> Self {
        let kind = err.kind();
        let message = match &err {
            ExpenseError::AuthenticationRequired { .. } => {
                "Authentication required: complete the login at login_url, then retry".to_string()
            }
            ExpenseError::ReAuthenticationRequired(_) => {
                "Session can no longer be refreshed; log in again".to_string()
            }
            // Internal details stay in the logs
            ExpenseError::Storage(_) | ExpenseError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            kind,
            message,
            login_url: err.login_url().map(str::to_string),
        }
    }
}
