//! Mock implementations and test utilities for the expense MCP server
//!
//! This crate provides the testing infrastructure shared by the other crates:
//! - Mock implementations of every core trait (backend, token endpoint,
//!   OAuth provider, session repository)
//! - Fixtures and builders for reports, expenses and sessions
//! - Random data generators and property-based testing strategies
//! - Contract tests and assertion helpers

pub mod assertions;
pub mod backend;
pub mod builders;
pub mod contracts;
pub mod fixtures;
pub mod generators;
pub mod oauth;
pub mod repository;

pub use assertions::*;
pub use backend::{MockExpenseBackend, MockTokenEndpoint};
pub use builders::*;
pub use contracts::*;
pub use fixtures::*;
pub use generators::*;
pub use oauth::MockOAuthProvider;
pub use repository::MockSessionRepository;
