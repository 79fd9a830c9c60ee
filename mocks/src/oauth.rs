//! Mock OAuth provider adapter
//!
//! Builds real signed authorization URLs through
//! [`AuthorizationRequest`] so it can be driven by an
//! [`AuthorizationFlow`](expense_core::AuthorizationFlow), and scripts the
//! outcome of code exchanges and refreshes.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use expense_core::{
    models::claims, oauth::ensure_state_matches, AuthorizationRequest, ExpenseError,
    OAuthProvider, PendingAuthorization, Provider, Result, SecretKey, StateSigner, UserSession,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const MOCK_AUTHORIZE_URL: &str = "https://login.mock.test/oauth2/authorize";
/// Root secret behind [`MockOAuthProvider::default_signer`]
pub const MOCK_SECRET: &str = "mock-oauth-secret";

/// Mock implementation of OAuthProvider for testing
///
/// Exchanged sessions belong to `"<provider>:<code>"`, so each distinct
/// authorization code logs in a distinct user. Refreshes never rotate the
/// refresh token.
#[derive(Clone)]
pub struct MockOAuthProvider {
    kind: Provider,
    signer: StateSigner,
    lifetime: Arc<Mutex<Duration>>,
    refresh_delay: Arc<Mutex<Option<std::time::Duration>>>,
    exchange_errors: Arc<Mutex<VecDeque<ExpenseError>>>,
    refresh_errors: Arc<Mutex<VecDeque<ExpenseError>>>,
    exchange_calls: Arc<AtomicUsize>,
    refresh_calls: Arc<AtomicUsize>,
}

impl MockOAuthProvider {
    pub fn new(kind: Provider) -> Self {
        Self {
            kind,
            signer: Self::default_signer(),
            lifetime: Arc::new(Mutex::new(Duration::hours(1))),
            refresh_delay: Arc::new(Mutex::new(None)),
            exchange_errors: Arc::new(Mutex::new(VecDeque::new())),
            refresh_errors: Arc::new(Mutex::new(VecDeque::new())),
            exchange_calls: Arc::new(AtomicUsize::new(0)),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn microsoft() -> Self {
        Self::new(Provider::Microsoft)
    }

    pub fn google() -> Self {
        Self::new(Provider::Google)
    }

    /// Signer matching the states this mock issues by default
    pub fn default_signer() -> StateSigner {
        match SecretKey::new(MOCK_SECRET) {
            Ok(key) => key.state_signer(),
            Err(_) => unreachable!("mock secret is not empty"),
        }
    }

    /// The signer used for issued states, to configure a matching flow
    pub fn signer(&self) -> StateSigner {
        self.signer.clone()
    }

    /// Lifetime of issued and refreshed access tokens
    pub fn set_lifetime(&self, lifetime: Duration) {
        *self.lifetime.lock() = lifetime;
    }

    /// Delay every refresh, to widen race windows in concurrency tests
    pub fn with_refresh_delay(self, delay: std::time::Duration) -> Self {
        *self.refresh_delay.lock() = Some(delay);
        self
    }

    pub fn inject_exchange_error(&self, error: ExpenseError) {
        self.exchange_errors.lock().push_back(error);
    }

    pub fn inject_refresh_error(&self, error: ExpenseError) {
        self.refresh_errors.lock().push_back(error);
    }

    pub fn exchange_count(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Pull the `state` query parameter out of an issued login URL
    pub fn state_from_url(login_url: &str) -> Option<String> {
        let (_, query) = login_url.split_once('?')?;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("state="))
            .map(str::to_string)
    }
}

#[async_trait]
impl OAuthProvider for MockOAuthProvider {
    fn kind(&self) -> Option<Provider> {
        Some(self.kind)
    }

    fn build_authorization_url(
        &self,
        redirect_uri: &str,
    ) -> Result<(String, PendingAuthorization)> {
        AuthorizationRequest {
            provider: self.kind,
            authorize_endpoint: MOCK_AUTHORIZE_URL,
            client_id: "mock-client",
            redirect_uri,
            scopes: "openid email profile",
            extra_params: &[],
        }
        .build(&self.signer)
    }

    async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        pending: &PendingAuthorization,
    ) -> Result<UserSession> {
        ensure_state_matches(state, pending)?;
        let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let injected = self.exchange_errors.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let mut session_claims = BTreeMap::new();
        session_claims.insert(claims::SUBJECT.to_string(), code.to_string());
        session_claims.insert(claims::EMAIL.to_string(), format!("{code}@example.test"));
        session_claims.insert(claims::NAME.to_string(), format!("User {code}"));

        Ok(UserSession {
            user_id: format!("{}:{code}", self.kind),
            provider: self.kind,
            access_token: format!("user-access-{n}"),
            refresh_token: Some(format!("user-refresh-{code}")),
            expires_at: Utc::now() + *self.lifetime.lock(),
            claims: session_claims,
        })
    }

    async fn refresh(&self, session: &UserSession) -> Result<UserSession> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.refresh_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let injected = self.refresh_errors.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        if session.refresh_token.is_none() {
            return Err(ExpenseError::ReAuthenticationRequired(
                "session has no refresh token".to_string(),
            ));
        }

        Ok(UserSession {
            user_id: session.user_id.clone(),
            provider: self.kind,
            access_token: format!("refreshed-access-{n}"),
            refresh_token: None,
            expires_at: Utc::now() + *self.lifetime.lock(),
            claims: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_identifies_user_by_code() {
        let provider = MockOAuthProvider::google();
        let (url, pending) = provider.build_authorization_url("http://localhost/cb").unwrap();
        assert!(url.starts_with(MOCK_AUTHORIZE_URL));
        assert_eq!(
            MockOAuthProvider::state_from_url(&url).as_deref(),
            Some(pending.state.as_str())
        );
        assert!(provider.signer().verify(&pending.state));

        let session = provider
            .exchange_code("alice", &pending.state, &pending)
            .await
            .unwrap();
        assert_eq!(session.user_id, "google:alice");
        assert_eq!(session.email(), Some("alice@example.test"));
        assert_eq!(provider.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_errors_are_injected() {
        let provider = MockOAuthProvider::microsoft();
        provider.inject_refresh_error(ExpenseError::ReAuthenticationRequired("revoked".into()));
        let session = crate::fixtures::create_expired_session("microsoft:bob", true);

        assert!(provider.refresh(&session).await.is_err());
        let refreshed = provider.refresh(&session).await.unwrap();
        assert_eq!(refreshed.user_id, "microsoft:bob");
        assert!(refreshed.expires_at > Utc::now());
        assert_eq!(provider.refresh_count(), 2);
    }
}
