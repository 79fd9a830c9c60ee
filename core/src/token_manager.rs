use crate::{
    backend::TokenEndpoint,
    error::{ExpenseError, Result},
    models::ServiceToken,
    single_flight::SingleFlight,
};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tokens are refreshed this long before their reported expiry
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 60;

/// Assumed lifetime when the token endpoint omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Acquires and caches the service-level bearer token.
///
/// Reads of a valid cached token never wait on each other. When the token is
/// missing or inside the safety margin, all concurrent callers collapse into
/// one password-grant exchange and observe the same outcome.
pub struct BackendTokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    cache: Arc<RwLock<Option<ServiceToken>>>,
    flight: SingleFlight<(), ServiceToken>,
    safety_margin: Duration,
    default_lifetime: Duration,
}

impl BackendTokenManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            endpoint,
            cache: Arc::new(RwLock::new(None)),
            flight: SingleFlight::new(),
            safety_margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            default_lifetime: Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }

    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin.max(Duration::zero());
        self
    }

    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    /// Currently cached token, valid or not
    pub fn cached(&self) -> Option<ServiceToken> {
        self.cache.read().clone()
    }

    fn cached_valid(&self) -> Option<ServiceToken> {
        let now = Utc::now();
        self.cache
            .read()
            .as_ref()
            .filter(|token| token.is_valid_at(now, self.safety_margin))
            .cloned()
    }

    /// Return a valid service token, exchanging credentials if needed
    ///
    /// # Returns
    /// * `Err(ExpenseError::Credential)` - backend rejected the grant (not retried)
    /// * `Err(ExpenseError::TransientNetwork)` - endpoint unreachable after one retry
    pub async fn get_token(&self) -> Result<ServiceToken> {
        if let Some(token) = self.cached_valid() {
            return Ok(token);
        }

        let endpoint = self.endpoint.clone();
        let cache = self.cache.clone();
        let margin = self.safety_margin;
        let lifetime = self.default_lifetime;

        self.flight
            .run((), move || async move {
                // Another flight may have refreshed while this one was queued
                let now = Utc::now();
                let fresh = cache
                    .read()
                    .as_ref()
                    .filter(|token| token.is_valid_at(now, margin))
                    .cloned();
                if let Some(token) = fresh {
                    debug!("Service token already refreshed by a concurrent caller");
                    return Ok(token);
                }

                let grant = match endpoint.password_grant().await {
                    Err(e) if e.is_retryable() => {
                        warn!(error = %e, "Password grant failed transiently, retrying once");
                        endpoint.password_grant().await?
                    }
                    other => other?,
                };

                let now = Utc::now();
                let expires_at = grant.expires_at(now, lifetime).ok_or_else(|| {
                    ExpenseError::Credential(
                        "token endpoint issued an unrepresentable lifetime".to_string(),
                    )
                })?;
                if expires_at <= now {
                    return Err(ExpenseError::Credential(
                        "token endpoint issued an already expired token".to_string(),
                    ));
                }

                let token = ServiceToken::new(grant.access_token, now, expires_at);
                *cache.write() = Some(token.clone());
                info!(expires_at = %token.expires_at, "Obtained backend service token");
                Ok(token)
            })
            .await
    }

    /// Drop the cached token if it is still the one the backend just rejected.
    ///
    /// Comparing against the stale value keeps a concurrent caller from
    /// discarding a token that was already replaced.
    pub fn invalidate(&self, stale: &ServiceToken) -> bool {
        let mut cache = self.cache.write();
        if cache.as_ref().is_some_and(|current| current == stale) {
            *cache = None;
            debug!("Invalidated rejected service token");
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenGrant;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedEndpoint {
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<i64>>>,
        delay: std::time::Duration,
    }

    impl ScriptedEndpoint {
        fn new(script: Vec<Result<i64>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                delay: std::time::Duration::from_millis(20),
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for ScriptedEndpoint {
        async fn password_grant(&self) -> Result<TokenGrant> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            let expires_in = self.script.lock().pop_front().unwrap_or(Ok(3600))?;
            Ok(TokenGrant {
                access_token: format!("token-{n}"),
                refresh_token: None,
                id_token: None,
                expires_in: Some(expires_in),
            })
        }
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_trigger_single_exchange() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let manager = Arc::new(BackendTokenManager::new(endpoint.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap().secret().to_string());
        }

        assert!(values.iter().all(|v| v == "token-1"));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_inside_margin_is_refreshed() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Ok(30), Ok(3600)]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first.secret(), "token-1");
        assert_eq!(second.secret(), "token-2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_credential_error_is_not_retried() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Err(ExpenseError::Credential(
            "invalid_client".into(),
        ))]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let err = manager.get_token().await.unwrap_err();
        assert_eq!(err, ExpenseError::Credential("invalid_client".into()));
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
        assert!(manager.cached().is_none());
    }

    #[tokio::test]
    async fn test_transient_error_is_retried_once() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            Err(ExpenseError::transient("connect timeout")),
            Ok(3600),
        ]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let token = manager.get_token().await.unwrap();
        assert_eq!(token.secret(), "token-2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_clears_matching_token() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let first = manager.get_token().await.unwrap();
        assert!(manager.invalidate(&first));
        let second = manager.get_token().await.unwrap();
        assert_ne!(first, second);

        // A late invalidation for the old token leaves the new one alone
        assert!(!manager.invalidate(&first));
        assert_eq!(manager.cached(), Some(second));
    }

    #[tokio::test]
    async fn test_zero_lifetime_token_is_rejected() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Ok(0)]));
        let manager = BackendTokenManager::new(endpoint).with_safety_margin(Duration::zero());

        assert!(matches!(
            manager.get_token().await,
            Err(ExpenseError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_huge_lifetime_is_clamped() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Ok(10_000_000_000_000)]));
        let manager = BackendTokenManager::new(endpoint.clone());

        let before = Utc::now();
        let token = manager.get_token().await.unwrap();
        let max_lifetime = Duration::days(crate::models::MAX_TOKEN_LIFETIME_DAYS);
        assert!(token.expires_at > before + Duration::days(300));
        assert!(token.expires_at <= Utc::now() + max_lifetime);

        // Still served from the cache afterwards
        manager.get_token().await.unwrap();
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_after_expiry_share_one_exchange() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Ok(1), Ok(3600)]));
        let manager = Arc::new(
            BackendTokenManager::new(endpoint.clone()).with_safety_margin(Duration::zero()),
        );

        let first = manager.get_token().await.unwrap();
        assert_eq!(first.secret(), "token-1");

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(first.expires_at <= Utc::now());

        let (a, b) = tokio::join!(manager.get_token(), manager.get_token());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a, b);
        assert_eq!(a.secret(), "token-2");
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);
    }
}
