use chrono::Utc;
use expense_core::{
    BackendTokenManager, ExpenseError, OAuthProvider, SessionRepository, UserSessionStore,
};
use futures::future::join_all;
use mocks::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_mock_repository_passes_contract() {
    let repo = MockSessionRepository::new();
    test_session_repository_contract(&repo).await;
}

#[tokio::test]
async fn test_concurrent_token_requests_share_one_grant() {
    let endpoint = Arc::new(MockTokenEndpoint::new().with_delay(Duration::from_millis(50)));
    let manager = Arc::new(BackendTokenManager::new(endpoint.clone()));

    let tokens = join_all((0..16).map(|_| {
        let manager = manager.clone();
        async move { manager.get_token().await }
    }))
    .await;

    assert_eq!(endpoint.grant_count(), 1);
    for token in tokens {
        assert_eq!(token.unwrap().secret(), "svc-1");
    }
}

#[tokio::test]
async fn test_store_persists_refreshed_session() {
    let repo = Arc::new(MockSessionRepository::with_sessions(vec![
        create_expired_session("google:amy", true),
    ]));
    let store = UserSessionStore::with_repository(repo.clone());
    assert_eq!(store.hydrate().await.unwrap(), 1);

    let provider: Arc<dyn OAuthProvider> = Arc::new(MockOAuthProvider::google());
    let refreshed = store.refresh("google:amy", provider).await.unwrap();

    let persisted = repo.stored("google:amy").unwrap();
    assert_eq!(persisted.access_token, refreshed.access_token);
    assert!(persisted.expires_at > Utc::now());
    // Provider did not rotate it, so the original survives
    assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-amy"));
}

#[tokio::test]
async fn test_concurrent_session_refresh_runs_once() {
    let provider = Arc::new(MockOAuthProvider::microsoft().with_refresh_delay(Duration::from_millis(50)));
    let store = Arc::new(UserSessionStore::in_memory());
    store
        .put(create_expired_session("microsoft:kai", true))
        .await
        .unwrap();

    let results = join_all((0..8).map(|_| {
        let store = store.clone();
        let provider: Arc<dyn OAuthProvider> = provider.clone();
        async move { store.refresh("microsoft:kai", provider).await }
    }))
    .await;

    assert_eq!(provider.refresh_count(), 1);
    let first = results[0].as_ref().unwrap().access_token.clone();
    for result in &results {
        assert_eq!(result.as_ref().unwrap().access_token, first);
    }
}

#[tokio::test]
async fn test_revoked_refresh_token_evicts_session() {
    let provider = MockOAuthProvider::google();
    provider.inject_refresh_error(ExpenseError::ReAuthenticationRequired("revoked".into()));
    let repo = Arc::new(MockSessionRepository::new());
    let store = UserSessionStore::with_repository(repo.clone());
    store
        .put(create_expired_session("google:zed", true))
        .await
        .unwrap();

    let err = store
        .refresh("google:zed", Arc::new(provider))
        .await
        .unwrap_err();
    assert!(matches!(err, ExpenseError::ReAuthenticationRequired(_)));
    assert!(store.get("google:zed").await.unwrap().is_none());
    assert!(repo.load("google:zed").await.unwrap().is_none());
}
