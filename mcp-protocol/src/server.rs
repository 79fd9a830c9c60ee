//! MCP HTTP server
//!
//! Streamable HTTP transport (2025-06-18) on `POST /mcp`, plus the browser
//! endpoints of the user login flow. The `Mcp-Session-Id` header identifies
//! the connection; a fresh id is issued when a client sends none, and a login
//! started from that connection is bound to it on callback.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use expense_core::{CallerContext, Dispatcher, ExpenseError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::McpError,
    rpc::{McpRouter, LEGACY_PROTOCOL_VERSION, MCP_PROTOCOL_VERSION},
};

/// Header carrying the connection id
pub const SESSION_HEADER: &str = "mcp-session-id";

const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Which endpoints the HTTP listener exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoints {
    /// MCP plus the browser login endpoints
    Full,
    /// Browser login endpoints and health only, for the stdio transport
    CallbackOnly,
}

/// MCP server over HTTP
pub struct McpServer {
    router: McpRouter,
    endpoints: Endpoints,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            router: McpRouter::new(dispatcher),
            endpoints: Endpoints::Full,
        }
    }

    /// Listener that only completes browser logins; `/mcp` and logout are not routed
    pub fn callback_only(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            router: McpRouter::new(dispatcher),
            endpoints: Endpoints::CallbackOnly,
        }
    }

    /// Start the server and run until the listener fails
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Start the server and stop gracefully once `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let socket_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{addr}': {e}"))?;

        let listener = tokio::net::TcpListener::bind(socket_addr).await?;
        info!(addr = %socket_addr, endpoints = ?self.endpoints, "MCP HTTP server listening");

        axum::serve(listener, self.create_router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("MCP HTTP server stopped");
        Ok(())
    }

    /// Create the router for the configured endpoints
    pub fn create_router(&self) -> Router {
        let state = Arc::new(self.router.clone());

        let mut router = Router::new()
            .route("/oauth/login", get(login_handler))
            .route("/oauth/callback", get(callback_handler))
            .route("/health", get(health_handler));
        if self.endpoints == Endpoints::Full {
            router = router
                .route("/mcp", post(rpc_handler))
                .route("/oauth/logout", post(logout_handler));
        }

        router
            .layer(middleware::from_fn(
                crate::request_logger::mcp_request_logging_middleware,
            ))
            .with_state(state)
    }
}

fn connection_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn rpc_handler(
    State(router): State<Arc<McpRouter>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    let id = request.get("id").cloned();
    let session_id = connection_id(&headers).unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        PROTOCOL_VERSION_HEADER,
        HeaderValue::from_static(MCP_PROTOCOL_VERSION),
    );
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response_headers.insert(SESSION_HEADER, value);
    }

    let protocol_version = headers
        .get(PROTOCOL_VERSION_HEADER)
        .and_then(|v| v.to_str().ok());
    match protocol_version {
        Some(version) if version == MCP_PROTOCOL_VERSION || version == LEGACY_PROTOCOL_VERSION => {}
        Some(version) => {
            let error = McpError::Protocol(format!(
                "Unsupported MCP-Protocol-Version: {version}. Supported versions: {MCP_PROTOCOL_VERSION}, {LEGACY_PROTOCOL_VERSION}"
            ));
            return (response_headers, Json(error.to_json_rpc_error(id))).into_response();
        }
        None => {}
    }

    if request.is_array() {
        let error = McpError::Protocol(
            "JSON-RPC batching is not supported in MCP 2025-06-18".to_string(),
        );
        return (response_headers, Json(error.to_json_rpc_error(None))).into_response();
    }

    let caller = CallerContext::new(session_id);
    match router.handle(&request, &caller).await {
        Some(response) => (response_headers, Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, response_headers).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    connection_id: Option<String>,
}

async fn login_handler(
    State(router): State<Arc<McpRouter>>,
    Query(params): Query<LoginParams>,
) -> Response {
    let flow = router.dispatcher().flow();
    match flow.begin(params.connection_id.as_deref()) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(ExpenseError::OAuthNotConfigured) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Html(page("Login unavailable", "User login is not configured on this server.")),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Could not start OAuth login");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(page("Login unavailable", "The login could not be started.")),
            )
                .into_response()
        }
    }
}

/// Query parameters of the provider redirect
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn callback_handler(
    State(router): State<Arc<McpRouter>>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        warn!(error = %error, description = %description, "Provider returned an OAuth error");
        return (
            StatusCode::BAD_REQUEST,
            Html(page("Login failed", &format!("{error}: {description}"))),
        );
    }
    let (Some(code), Some(state)) = (params.code, params.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(page("Login failed", "The callback is missing 'code' or 'state'.")),
        );
    };

    match router.dispatcher().flow().complete(&state, &code).await {
        Ok(session) => {
            let who = session.email().unwrap_or(&session.user_id).to_string();
            (
                StatusCode::OK,
                Html(page(
                    "Login complete",
                    &format!("Signed in as {who}. You can close this window and retry the tool."),
                )),
            )
        }
        Err(e) => {
            let status = match &e {
                ExpenseError::AuthenticationFailed(_) => StatusCode::BAD_REQUEST,
                ExpenseError::OAuthNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
                ExpenseError::TransientNetwork(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            let message = expense_core::ToolError::from(e).message;
            (status, Html(page("Login failed", &message)))
        }
    }
}

async fn logout_handler(
    State(router): State<Arc<McpRouter>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let Some(connection_id) = connection_id(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Missing {SESSION_HEADER} header") })),
        );
    };
    match router.dispatcher().flow().logout(&connection_id).await {
        Ok(logged_out) => (StatusCode::OK, Json(json!({ "logged_out": logged_out }))),
        Err(e) => {
            warn!(error = %e, "Logout failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Logout failed" })),
            )
        }
    }
}

async fn health_handler(State(router): State<Arc<McpRouter>>) -> impl IntoResponse {
    let flow = router.dispatcher().flow();
    let (status, storage) = match flow.sessions().health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "Session storage health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };
    (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        Json(json!({
            "status": if status.is_success() { "ok" } else { "degraded" },
            "session_storage": storage,
            "oauth_configured": flow.is_configured(),
            "provider": flow.provider_kind().map(|p| p.as_str()).unwrap_or("none"),
            "active_sessions": flow.sessions().len(),
            "pending_logins": flow.pending().len(),
        })),
    )
}

/// Minimal browser page; `message` is HTML-escaped
fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>{title}</title></head>
<body>
<h1>{title}</h1>
<p>{}</p>
</body>
</html>"#,
        html_escape::encode_text(message)
    )
}
