//! MCP Protocol Implementation
//!
//! This crate exposes the expense tools over the Model Context Protocol.
//!
//! # Overview
//!
//! - [`tools`] - the expense tool handlers and the default registry
//! - [`rpc`] - JSON-RPC method routing (`initialize`, `tools/list`, `tools/call`)
//! - [`error`] - mapping of tool failures onto JSON-RPC error codes
//! - [`server`] - axum HTTP transport, including the OAuth login endpoints
//!
//! # Usage
//!
//! ```no_run
//! use expense_core::{
//!     AuthorizationFlow, AuthorizedBackend, BackendTokenManager, Dispatcher, ExpenseBackend,
//!     RetryPolicy, TokenEndpoint, UserSessionStore,
//! };
//! use mcp_protocol::{default_registry, McpServer};
//! use std::sync::Arc;
//!
//! async fn start_server(
//!     backend: Arc<dyn ExpenseBackend>,
//!     endpoint: Arc<dyn TokenEndpoint>,
//! ) -> anyhow::Result<()> {
//!     let tokens = Arc::new(BackendTokenManager::new(endpoint));
//!     let flow = Arc::new(AuthorizationFlow::disabled(Arc::new(UserSessionStore::in_memory())));
//!     let dispatcher = Dispatcher::new(
//!         Arc::new(default_registry()?),
//!         AuthorizedBackend::new(backend, tokens, RetryPolicy::default()),
//!         flow,
//!     );
//!     McpServer::new(Arc::new(dispatcher)).serve("127.0.0.1:3000").await
//! }
//! ```

pub mod error;
pub mod request_logger;
pub mod rpc;
pub mod server;
pub mod tools;

// Re-export key types for easier usage
pub use error::McpError;
pub use rpc::{McpRouter, MCP_PROTOCOL_VERSION, SERVER_NAME};
pub use server::{McpServer, SESSION_HEADER};
pub use tools::{default_registry, DEFAULT_LIMIT};
