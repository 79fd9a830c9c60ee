//! HTTP connectors for the expense MCP server.
//!
//! - [`concur`] - expense backend client and password-grant token endpoint
//! - [`oauth`] - Microsoft and Google user-level OAuth adapters
//! - [`http`] - shared reqwest plumbing and status mapping
//! - [`jwt`] - ID token claim decoding

pub mod concur;
pub mod http;
pub mod jwt;
pub mod oauth;

pub use concur::{ConcurClient, ConcurConfig};
pub use oauth::{build_provider, GoogleProvider, MicrosoftProvider, OAuthClientSettings, ProviderEndpoints};
