//! Contract test helpers for validating trait implementations
//!
//! Provides standardized tests that any [`SessionRepository`] implementation
//! should pass, ensuring consistent behavior across the in-memory mock and
//! the SQLite store.

use crate::builders::UserSessionBuilder;
use chrono::{Duration, Timelike, Utc};
use expense_core::{Provider, SessionRepository};

/// Test any SessionRepository implementation with the full contract
///
/// Uses user ids under the `contract:` namespace; the repository should be
/// empty of those ids when called.
pub async fn test_session_repository_contract<R: SessionRepository>(repo: &R) {
    test_missing_contract(repo).await;
    test_save_load_contract(repo).await;
    test_overwrite_contract(repo).await;
    test_delete_contract(repo).await;
    test_load_all_contract(repo).await;
}

/// Unknown users load as `None`
pub async fn test_missing_contract<R: SessionRepository>(repo: &R) {
    let loaded = repo
        .load("contract:nobody")
        .await
        .expect("Load of a missing session should succeed");
    assert!(loaded.is_none(), "Missing session should load as None");
    assert!(
        !repo.delete("contract:nobody").await.expect("Delete should succeed"),
        "Deleting a missing session should report false"
    );
}

/// Every field survives a save/load cycle
pub async fn test_save_load_contract<R: SessionRepository>(repo: &R) {
    // Whole seconds so storage precision cannot affect equality
    let expires_at = Utc::now()
        .checked_add_signed(Duration::hours(2))
        .and_then(|t| t.with_nanosecond(0))
        .expect("Valid expiry");
    let session = UserSessionBuilder::new("contract:save")
        .with_provider(Provider::Google)
        .with_access_token("contract-access")
        .with_refresh_token("contract-refresh")
        .expires_at(expires_at)
        .with_claim("email", "save@example.test")
        .with_claim("name", "Save Contract")
        .build();

    repo.save(&session).await.expect("Save should succeed");
    let loaded = repo
        .load("contract:save")
        .await
        .expect("Load should succeed")
        .expect("Saved session should be found");

    assert_eq!(loaded, session, "Loaded session should equal the saved one");
}

/// Saving the same user replaces the previous session
pub async fn test_overwrite_contract<R: SessionRepository>(repo: &R) {
    let first = UserSessionBuilder::new("contract:overwrite")
        .with_access_token("first")
        .build();
    let second = UserSessionBuilder::new("contract:overwrite")
        .with_access_token("second")
        .without_refresh_token()
        .build();

    repo.save(&first).await.expect("Save should succeed");
    repo.save(&second).await.expect("Overwrite should succeed");

    let loaded = repo
        .load("contract:overwrite")
        .await
        .expect("Load should succeed")
        .expect("Session should be found");
    assert_eq!(loaded.access_token, "second");
    assert!(loaded.refresh_token.is_none(), "Refresh token should be replaced too");
}

/// Deleted sessions are gone and the delete reports it
pub async fn test_delete_contract<R: SessionRepository>(repo: &R) {
    let session = UserSessionBuilder::new("contract:delete").build();
    repo.save(&session).await.expect("Save should succeed");

    assert!(repo.delete("contract:delete").await.expect("Delete should succeed"));
    assert!(repo
        .load("contract:delete")
        .await
        .expect("Load should succeed")
        .is_none());
}

/// `load_all` returns every stored session
pub async fn test_load_all_contract<R: SessionRepository>(repo: &R) {
    for user in ["contract:all-a", "contract:all-b"] {
        repo.save(&UserSessionBuilder::new(user).build())
            .await
            .expect("Save should succeed");
    }
    let all = repo.load_all().await.expect("Load all should succeed");
    for user in ["contract:all-a", "contract:all-b"] {
        assert!(
            all.iter().any(|s| s.user_id == user),
            "load_all should include {user}"
        );
    }
}
