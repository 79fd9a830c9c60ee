use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use expense_core::{
    AuthorizationFlow, AuthorizedBackend, BackendTokenManager, Dispatcher, ExpenseError,
    RetryPolicy, UserSessionStore,
};
use http_body_util::BodyExt;
use mcp_protocol::{default_registry, McpServer, MCP_PROTOCOL_VERSION, SESSION_HEADER};
use mocks::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    backend: MockExpenseBackend,
    provider: MockOAuthProvider,
}

fn dispatcher(
    backend: &MockExpenseBackend,
    provider: &MockOAuthProvider,
    sessions: Arc<UserSessionStore>,
    oauth: bool,
) -> Arc<Dispatcher> {
    let tokens = Arc::new(BackendTokenManager::new(Arc::new(MockTokenEndpoint::new())));
    let flow = if oauth {
        AuthorizationFlow::new(
            Arc::new(provider.clone()),
            sessions,
            "http://localhost:8080/oauth/callback",
        )
        .with_state_signer(provider.signer())
    } else {
        AuthorizationFlow::disabled(sessions)
    };
    Arc::new(Dispatcher::new(
        Arc::new(default_registry().unwrap()),
        AuthorizedBackend::new(Arc::new(backend.clone()), tokens, RetryPolicy::none()),
        Arc::new(flow),
    ))
}

fn test_app(oauth: bool) -> TestApp {
    let backend = MockExpenseBackend::with_reports(create_test_reports(10));
    let provider = MockOAuthProvider::microsoft();
    let sessions = Arc::new(UserSessionStore::in_memory());
    let dispatcher = dispatcher(&backend, &provider, sessions, oauth);
    TestApp {
        app: McpServer::new(dispatcher).create_router(),
        backend,
        provider,
    }
}

fn rpc_request(session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(session) = session {
        builder = builder.header(SESSION_HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn tool_call(id: u64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_initialize_issues_session_id() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(rpc_request(
            None,
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": MCP_PROTOCOL_VERSION}
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session = response.headers().get(SESSION_HEADER).unwrap();
    assert!(!session.to_str().unwrap().is_empty());
    assert_eq!(
        response.headers().get("mcp-protocol-version").unwrap(),
        MCP_PROTOCOL_VERSION
    );

    let body = body_json(response).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
    assert_eq!(body["result"]["serverInfo"]["name"], "expense-mcp");
}

#[tokio::test]
async fn test_tools_list() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(rpc_request(
            Some("conn-1"),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.headers().get(SESSION_HEADER).unwrap(), "conn-1");
    let body = body_json(response).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 10);
    let profile = tools
        .iter()
        .find(|t| t["name"] == "get_user_profile")
        .unwrap();
    assert_eq!(profile["annotations"]["requiresUserLogin"], true);
    assert!(profile["inputSchema"].is_object());
}

#[tokio::test]
async fn test_public_tool_call() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(rpc_request(
            Some("conn-1"),
            tool_call(3, "list_reports_public", json!({"limit": 4})),
        ))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["result"]["isError"], false);
    assert_eq!(body["result"]["structuredContent"]["count"], 4);
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    assert!(text.contains("RPT-004"));
    t.backend.assert_called("list_reports");
}

#[tokio::test]
async fn test_protected_tool_without_oauth() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(rpc_request(
            Some("conn-1"),
            tool_call(4, "get_user_profile", json!({})),
        ))
        .await
        .unwrap();

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32003);
    assert_eq!(body["error"]["data"]["kind"], "oauth_not_configured");
    assert_eq!(body["id"], 4);
}

#[tokio::test]
async fn test_browser_login_binds_connection() {
    let t = test_app(true);

    let response = t
        .app
        .clone()
        .oneshot(rpc_request(
            Some("conn-9"),
            tool_call(5, "get_user_profile", json!({})),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32001);
    let login_url = body["error"]["data"]["login_url"].as_str().unwrap();
    let state = MockOAuthProvider::state_from_url(login_url).unwrap();
    t.backend.assert_not_called();

    let callback = Request::builder()
        .uri(format!("/oauth/callback?code=grace&state={state}"))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(callback).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("grace@example.test"));

    let response = t
        .app
        .clone()
        .oneshot(rpc_request(
            Some("conn-9"),
            tool_call(6, "get_user_profile", json!({})),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(
        body["result"]["structuredContent"]["user"]["user_id"],
        "microsoft:grace"
    );

    // Replaying the callback must not log anyone in again
    let replay = Request::builder()
        .uri(format!("/oauth/callback?code=mallory&state={state}"))
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(replay).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(t.provider.exchange_count(), 1);

    let logout = Request::builder()
        .method("POST")
        .uri("/oauth/logout")
        .header(SESSION_HEADER, "conn-9")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(logout).await.unwrap();
    assert_eq!(body_json(response).await["logged_out"], true);

    let response = t
        .app
        .oneshot(rpc_request(
            Some("conn-9"),
            tool_call(7, "get_user_profile", json!({})),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["error"]["code"], -32001);
}

#[tokio::test]
async fn test_callback_rejects_forged_state() {
    let t = test_app(true);
    let request = Request::builder()
        .uri("/oauth/callback?code=abc&state=forged")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(t.provider.exchange_count(), 0);
}

#[tokio::test]
async fn test_callback_with_provider_error_is_escaped() {
    let t = test_app(true);
    let request = Request::builder()
        .uri("/oauth/callback?error=access_denied&error_description=%3Cb%3Enope%3C%2Fb%3E")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let html = body_text(response).await;
    assert!(html.contains("access_denied"));
    assert!(!html.contains("<b>"));
}

#[tokio::test]
async fn test_login_redirects_to_provider() {
    let t = test_app(true);
    let request = Request::builder()
        .uri("/oauth/login?connection_id=conn-3")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();

    assert!(response.status().is_redirection());
    let location = response.headers().get(header::LOCATION).unwrap();
    assert!(location.to_str().unwrap().starts_with("https://login.mock.test/"));
}

#[tokio::test]
async fn test_login_unavailable_without_oauth() {
    let t = test_app(false);
    let request = Request::builder()
        .uri("/oauth/login")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_protocol_errors() {
    let t = test_app(false);

    let response = t
        .app
        .clone()
        .oneshot(rpc_request(
            Some("conn-1"),
            json!([{"jsonrpc": "2.0", "id": 1, "method": "tools/list"}]),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["error"]["code"], -32600);

    let response = t
        .app
        .clone()
        .oneshot(rpc_request(
            Some("conn-1"),
            json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}),
        ))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["error"]["code"], -32601);

    let response = t
        .app
        .clone()
        .oneshot(rpc_request(
            Some("conn-1"),
            tool_call(3, "delete_everything", json!({})),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32602);
    assert_eq!(body["error"]["data"]["kind"], "unknown_tool");

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header("mcp-protocol-version", "1999-01-01")
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}).to_string(),
        ))
        .unwrap();
    let response = t.app.oneshot(request).await.unwrap();
    assert_eq!(body_json(response).await["error"]["code"], -32600);
}

#[tokio::test]
async fn test_notification_is_accepted_without_body() {
    let t = test_app(false);
    let response = t
        .app
        .oneshot(rpc_request(
            Some("conn-1"),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_text(response).await.is_empty());
}

#[tokio::test]
async fn test_health() {
    let t = test_app(true);
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["oauth_configured"], true);
    assert_eq!(body["provider"], "microsoft");
    assert_eq!(body["active_sessions"], 0);
}

#[tokio::test]
async fn test_health_reports_failing_storage() {
    let repo = MockSessionRepository::new();
    let sessions = Arc::new(UserSessionStore::with_repository(Arc::new(repo.clone())));
    let app = McpServer::new(dispatcher(
        &MockExpenseBackend::new(),
        &MockOAuthProvider::microsoft(),
        sessions,
        true,
    ))
    .create_router();
    repo.inject_error(ExpenseError::Storage("database is locked".into()));

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["session_storage"], "unavailable");
    assert!(!body.to_string().contains("locked"));
    repo.assert_called("health_check");
}

#[tokio::test]
async fn test_callback_only_listener_does_not_route_mcp() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(1));
    let provider = MockOAuthProvider::microsoft();
    let sessions = Arc::new(UserSessionStore::in_memory());
    let app = McpServer::callback_only(dispatcher(&backend, &provider, sessions, true))
        .create_router();

    let response = app
        .clone()
        .oneshot(rpc_request(
            Some("stdio-1"),
            tool_call(1, "list_reports_public", json!({})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let logout = Request::builder()
        .method("POST")
        .uri("/oauth/logout")
        .header(SESSION_HEADER, "stdio-1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(logout).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let login = Request::builder()
        .uri("/oauth/login?connection_id=stdio-1")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(login).await.unwrap();
    assert!(response.status().is_redirection());

    let health = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["session_storage"], "ok");
    backend.assert_not_called();
}

#[tokio::test]
async fn test_oversized_request_is_refused() {
    let t = test_app(false);
    let padding = "x".repeat(mcp_protocol::request_logger::MAX_REQUEST_BODY_BYTES + 1);
    let request = rpc_request(
        Some("conn-1"),
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {"pad": padding}}),
    );

    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32600);
    t.backend.assert_not_called();
}
