//! Expense MCP Server Library
//!
//! Configuration loading, telemetry, component wiring and the stdio
//! transport of the `expense-mcp` binary.

pub mod config;
pub mod setup;
pub mod stdio;
pub mod telemetry;

pub use config::{Config, Transport};
pub use setup::{
    create_backend, create_dispatcher, create_session_store, ensure_database_directory,
    initialize_app,
};
pub use stdio::StdioMcpServer;
pub use telemetry::init_telemetry;
