use expense_core::{Dispatcher, NotConfigured, OAuthProvider, SecretKey, UserSessionStore};
use mcp_server::{config::OAuthProviderKind, create_dispatcher, Config, StdioMcpServer};
use mocks::oauth::MOCK_SECRET;
use mocks::*;
use serde_json::{json, Value};
use std::sync::Arc;

fn test_config() -> Config {
    let mut config = Config::default();
    config.backend.client_id = "cid".to_string();
    config.backend.client_secret = "csecret".to_string();
    config.backend.username = "svc".to_string();
    config.backend.password = "pw".to_string();
    config.retry.max_attempts = 1;
    config
}

fn dispatcher_with(
    backend: &MockExpenseBackend,
    provider: Option<MockOAuthProvider>,
) -> Arc<Dispatcher> {
    let mut config = test_config();
    let secret = SecretKey::new(MOCK_SECRET).unwrap();
    let provider: Arc<dyn OAuthProvider> = match provider {
        Some(provider) => {
            config.oauth.provider = OAuthProviderKind::Google;
            Arc::new(provider)
        }
        None => Arc::new(NotConfigured),
    };
    let dispatcher = create_dispatcher(
        &config,
        Arc::new(backend.clone()),
        Arc::new(MockTokenEndpoint::new()),
        provider,
        Arc::new(UserSessionStore::in_memory()),
        Some(&secret),
    )
    .unwrap();
    Arc::new(dispatcher)
}

/// Run one stdio session over the given lines and collect the responses
async fn run_session(server: StdioMcpServer, lines: &[Value]) -> Vec<Value> {
    let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
    let mut output = Vec::new();
    server.serve_io(input.as_bytes(), &mut output).await.unwrap();

    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn handshake() -> Vec<Value> {
    vec![
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
        }),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    ]
}

fn tool_call(id: u64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
}

#[tokio::test]
async fn test_handshake_list_and_call() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(6));
    let server = StdioMcpServer::with_connection_id(dispatcher_with(&backend, None), "stdio-1");

    let mut lines = handshake();
    lines.push(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}));
    lines.push(tool_call(3, "list_reports_public", json!({"limit": 2})));

    let responses = run_session(server, &lines).await;

    assert_eq!(responses.len(), 3, "the initialized notification gets no reply");
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"]["serverInfo"]["name"], "expense-mcp");
    assert_eq!(responses[1]["result"]["tools"].as_array().unwrap().len(), 10);
    assert_eq!(responses[2]["id"], 3);
    assert_eq!(responses[2]["result"]["structuredContent"]["count"], 2);
    assert_eq!(backend.call_count("list_reports"), 1);
}

#[tokio::test]
async fn test_requests_before_initialize_are_rejected() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(1));
    let server = StdioMcpServer::with_connection_id(dispatcher_with(&backend, None), "stdio-2");

    let lines = vec![
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}),
        json!({"jsonrpc": "2.0", "method": "notifications/cancelled"}),
    ];
    let responses = run_session(server, &lines).await;

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["error"]["code"], -32600);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[1]["id"], 2);
    assert!(responses[1]["result"].is_object());
    backend.assert_not_called();
}

#[tokio::test]
async fn test_malformed_line_yields_parse_error() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(1));
    let server = StdioMcpServer::with_connection_id(dispatcher_with(&backend, None), "stdio-3");

    let mut output = Vec::new();
    server
        .serve_io("{not json\n\n".as_bytes(), &mut output)
        .await
        .unwrap();

    let output = String::from_utf8(output).unwrap();
    let response: Value = serde_json::from_str(output.trim()).unwrap();
    assert_eq!(response["error"]["code"], -32700);
    assert!(response["id"].is_null());
}

#[tokio::test]
async fn test_protected_tool_without_oauth() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(1));
    let server = StdioMcpServer::with_connection_id(dispatcher_with(&backend, None), "stdio-4");

    let mut lines = handshake();
    lines.push(tool_call(2, "list_reports_protected", json!({})));
    lines.push(tool_call(3, "oauth_status", json!({})));
    let responses = run_session(server, &lines).await;

    assert_eq!(responses[1]["error"]["code"], -32003);
    assert_eq!(responses[1]["error"]["data"]["kind"], "oauth_not_configured");
    assert_eq!(responses[2]["result"]["structuredContent"]["oauth_available"], false);
    backend.assert_not_called();
}

#[tokio::test]
async fn test_login_binds_the_stdio_connection() {
    let backend = MockExpenseBackend::with_reports(create_test_reports(3));
    let provider = MockOAuthProvider::google();
    let dispatcher = dispatcher_with(&backend, Some(provider.clone()));

    let mut lines = handshake();
    lines.push(tool_call(2, "list_reports_protected", json!({})));
    let responses = run_session(
        StdioMcpServer::with_connection_id(dispatcher.clone(), "stdio-5"),
        &lines,
    )
    .await;

    assert_eq!(responses[1]["error"]["code"], -32001);
    let login_url = responses[1]["error"]["data"]["login_url"].as_str().unwrap();
    assert!(login_url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Foauth%2Fcallback"));
    backend.assert_not_called();

    // The browser lands on the callback listener
    let state = MockOAuthProvider::state_from_url(login_url).unwrap();
    let session = dispatcher.flow().complete(&state, "frank").await.unwrap();
    assert_eq!(session.user_id, "google:frank");

    let mut lines = handshake();
    lines.push(tool_call(2, "list_reports_protected", json!({"limit": 2})));
    let responses = run_session(
        StdioMcpServer::with_connection_id(dispatcher.clone(), "stdio-5"),
        &lines,
    )
    .await;

    let result = &responses[1]["result"]["structuredContent"];
    assert_eq!(result["count"], 2);
    assert_eq!(result["authenticated_user"]["user_id"], "google:frank");
    assert_eq!(provider.exchange_count(), 1);

    // Another process-level connection is not logged in
    let mut lines = handshake();
    lines.push(tool_call(2, "get_user_profile", json!({})));
    let responses = run_session(
        StdioMcpServer::with_connection_id(dispatcher, "stdio-6"),
        &lines,
    )
    .await;
    assert_eq!(responses[1]["error"]["code"], -32001);
}
