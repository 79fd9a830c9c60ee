//! Session persistence for the expense MCP server
//!
//! This crate provides the SQLite implementation of the
//! [`SessionRepository`] trait so user sessions survive restarts.
//!
//! # Features
//!
//! - SQLite with WAL mode for file databases, single shared connection for `:memory:`
//! - Embedded migrations
//! - Access and refresh tokens sealed with AES-256-GCM before storage
//!
//! # Usage
//!
//! ```rust,no_run
//! use database::{SessionRepository, SqliteSessionRepository};
//! use expense_core::SecretKey;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cipher = SecretKey::new("change-me")?.token_cipher();
//! let repo = SqliteSessionRepository::new("sessions.db", cipher).await?;
//! repo.migrate().await?;
//! repo.health_check().await?;
//! # Ok(())
//! # }
//! ```

mod common;
mod sqlite;

pub use sqlite::SqliteSessionRepository;

// Re-export commonly used types from expense-core for convenience
pub use expense_core::{ExpenseError, Result, SessionRepository, TokenCipher, UserSession};
