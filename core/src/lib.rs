//! Expense Core Library
//!
//! This crate provides the dual-authentication tool dispatch core of the
//! expense-report MCP server: domain models, the error taxonomy, the backend
//! token manager, the user session store, the OAuth provider contract and
//! login flow, the tool registry and the dispatcher. It performs no HTTP
//! itself; concrete backends and providers live in `expense-connectors`.
//!
//! # Architecture
//!
//! - [`models`] - Tokens, sessions, pending logins, reports
//! - [`error`] - Error taxonomy and the caller-facing [`ToolError`]
//! - [`backend`] - Backend API and token endpoint traits
//! - [`token_manager`] - Service token cache with single-flight refresh
//! - [`session_store`] - Per-user sessions with pluggable persistence
//! - [`oauth`] - Provider contract, PKCE, pending logins, authorization flow
//! - [`registry`] - Tool descriptors and the immutable registry
//! - [`dispatcher`] - Credential resolution and tool invocation
//!
//! # Example
//!
//! ```rust
//! use expense_core::{CallerContext, ToolRegistry, ToolVisibility};
//!
//! let registry = ToolRegistry::builder().build();
//! assert!(registry.get("list_reports_public").is_none());
//!
//! let caller = CallerContext::new("conn-1").with_user("google:42");
//! assert_eq!(caller.user_id.as_deref(), Some("google:42"));
//! assert_eq!(ToolVisibility::Protected.to_string(), "protected");
//! ```

pub mod backend;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod oauth;
pub mod registry;
pub mod retry;
pub mod session_store;
pub mod single_flight;
pub mod token_manager;

// Re-export commonly used types at the crate root for convenience
pub use backend::{clamp_limit, validate_id, ExpenseBackend, TokenEndpoint, MAX_LIMIT, MIN_LIMIT};
pub use crypto::{SecretKey, StateSigner, TokenCipher};
pub use dispatcher::{AuthorizedBackend, Dispatcher, ToolContext};
pub use error::{ErrorKind, ExpenseError, Result, ToolError};
pub use models::{
    CallerContext, ExpenseEntry, ExpenseType, PaymentType, PendingAuthorization, Provider,
    Report, ServiceToken, TokenGrant, UserSession,
};
pub use oauth::{
    AuthorizationFlow, AuthorizationRequest, NotConfigured, OAuthProvider,
    PendingAuthorizations, PkcePair,
};
pub use registry::{ToolDescriptor, ToolHandler, ToolRegistry, ToolVisibility};
pub use retry::RetryPolicy;
pub use session_store::{SessionRepository, UserSessionStore};
pub use single_flight::SingleFlight;
pub use token_manager::BackendTokenManager;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::const_is_empty)]
    fn test_crate_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(CRATE_NAME, "expense-core");
    }

    #[test]
    fn test_re_exports() {
        let provider: Provider = "google".parse().unwrap();
        assert_eq!(format!("{provider}"), "google");

        let error = ExpenseError::UnknownTool("x".into());
        assert_eq!(ToolError::from(error).kind, ErrorKind::UnknownTool);
    }
}
