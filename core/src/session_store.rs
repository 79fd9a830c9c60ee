use crate::{
    error::{ExpenseError, Result},
    models::UserSession,
    oauth::OAuthProvider,
    single_flight::SingleFlight,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Persistence backend for user sessions.
///
/// Implementations must protect access and refresh tokens at rest and be
/// thread-safe.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load every stored session, used to warm the cache at startup
    async fn load_all(&self) -> Result<Vec<UserSession>>;

    /// Load a single session by user id
    ///
    /// # Returns
    /// * `Ok(None)` - no session stored for that user
    /// * `Err(ExpenseError::Storage)` - the store could not be read or decrypted
    async fn load(&self, user_id: &str) -> Result<Option<UserSession>>;

    /// Insert or replace the session for `session.user_id`
    async fn save(&self, session: &UserSession) -> Result<()>;

    /// Delete the session, returning whether one existed
    async fn delete(&self, user_id: &str) -> Result<bool>;

    /// Verify the store answers queries
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

struct StoreInner {
    sessions: RwLock<HashMap<String, UserSession>>,
    repository: Option<Arc<dyn SessionRepository>>,
    /// Serializes map and repository writes so both agree on the last writer
    writes: Mutex<()>,
}

impl StoreInner {
    fn cached(&self, user_id: &str) -> Option<UserSession> {
        self.sessions.read().get(user_id).cloned()
    }

    async fn lookup(&self, user_id: &str) -> Result<Option<UserSession>> {
        if let Some(session) = self.cached(user_id) {
            return Ok(Some(session));
        }
        let Some(repository) = &self.repository else {
            return Ok(None);
        };
        let _guard = self.writes.lock().await;
        let loaded = repository.load(user_id).await?;
        if let Some(session) = &loaded {
            self.sessions
                .write()
                .entry(user_id.to_string())
                .or_insert_with(|| session.clone());
        }
        Ok(loaded)
    }

    async fn store(&self, session: UserSession) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.write(session).await
    }

    /// Replace the session only if the stored one still expires at `expected`
    async fn replace(&self, session: UserSession, expected: DateTime<Utc>) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if !self.holds(&session.user_id, expected) {
            return Ok(false);
        }
        self.write(session).await?;
        Ok(true)
    }

    async fn write(&self, session: UserSession) -> Result<()> {
        if let Some(repository) = &self.repository {
            repository.save(&session).await?;
        }
        self.sessions.write().insert(session.user_id.clone(), session);
        Ok(())
    }

    async fn evict(&self, user_id: &str) -> Result<Option<UserSession>> {
        let _guard = self.writes.lock().await;
        self.delete(user_id).await
    }

    /// Evict only if the stored session still expires at `expected`
    async fn evict_if(&self, user_id: &str, expected: DateTime<Utc>) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if !self.holds(user_id, expected) {
            return Ok(false);
        }
        self.delete(user_id).await?;
        Ok(true)
    }

    async fn delete(&self, user_id: &str) -> Result<Option<UserSession>> {
        let removed = self.sessions.write().remove(user_id);
        if let Some(repository) = &self.repository {
            repository.delete(user_id).await?;
        }
        Ok(removed)
    }

    fn holds(&self, user_id: &str, expected: DateTime<Utc>) -> bool {
        self.sessions
            .read()
            .get(user_id)
            .is_some_and(|s| s.expires_at == expected)
    }
}

/// Thread-safe per-user session map with optional write-through persistence.
///
/// `get` only ever returns sessions with `now < expires_at`. Expired sessions
/// that still hold a refresh token are kept so the dispatcher can call
/// [`refresh`](Self::refresh); expired sessions without one are evicted.
pub struct UserSessionStore {
    inner: Arc<StoreInner>,
    refreshes: SingleFlight<String, UserSession>,
}

impl Default for UserSessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl UserSessionStore {
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    pub fn with_repository(repository: Arc<dyn SessionRepository>) -> Self {
        Self::build(Some(repository))
    }

    fn build(repository: Option<Arc<dyn SessionRepository>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: RwLock::new(HashMap::new()),
                repository,
                writes: Mutex::new(()),
            }),
            refreshes: SingleFlight::new(),
        }
    }

    /// Warm the in-memory map from the repository
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(repository) = &self.inner.repository else {
            return Ok(0);
        };
        let _guard = self.inner.writes.lock().await;
        let loaded = repository.load_all().await?;
        let count = loaded.len();
        let mut sessions = self.inner.sessions.write();
        for session in loaded {
            sessions.insert(session.user_id.clone(), session);
        }
        info!(count, "Restored persisted user sessions");
        Ok(count)
    }

    /// Valid session for `user_id`, or `None` if absent or expired
    pub async fn get(&self, user_id: &str) -> Result<Option<UserSession>> {
        let Some(session) = self.inner.lookup(user_id).await? else {
            return Ok(None);
        };
        if session.is_valid_at(Utc::now()) {
            return Ok(Some(session));
        }
        if !session.is_refreshable() {
            debug!(user_id, "Evicting expired session without refresh token");
            self.inner.evict_if(user_id, session.expires_at).await?;
        }
        Ok(None)
    }

    /// Whether an expired-but-refreshable session is stored for `user_id`
    pub async fn has_refreshable(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .lookup(user_id)
            .await?
            .is_some_and(|s| s.is_refreshable()))
    }

    pub async fn put(&self, session: UserSession) -> Result<()> {
        info!(
            user_id = %session.user_id,
            provider = %session.provider,
            expires_at = %session.expires_at,
            "Storing user session"
        );
        self.inner.store(session).await
    }

    pub async fn remove(&self, user_id: &str) -> Result<Option<UserSession>> {
        self.inner.evict(user_id).await
    }

    /// Refresh the stored session for `user_id` through `provider`.
    ///
    /// Concurrent refreshes for the same user collapse into one provider call.
    /// The outcome is either a session with a strictly later expiry, or the
    /// session is removed and `ReAuthenticationRequired` is returned.
    /// Transient provider failures are retried once and then surfaced without
    /// touching the stored session.
    pub async fn refresh(
        &self,
        user_id: &str,
        provider: Arc<dyn OAuthProvider>,
    ) -> Result<UserSession> {
        let inner = self.inner.clone();
        let uid = user_id.to_string();

        self.refreshes
            .run(user_id.to_string(), move || async move {
                let Some(current) = inner.lookup(&uid).await? else {
                    return Err(ExpenseError::ReAuthenticationRequired(
                        "no session to refresh".to_string(),
                    ));
                };
                if current.is_valid_at(Utc::now()) {
                    return Ok(current);
                }
                if !current.is_refreshable() {
                    inner.evict_if(&uid, current.expires_at).await?;
                    return Err(ExpenseError::ReAuthenticationRequired(
                        "session expired and cannot be refreshed".to_string(),
                    ));
                }

                let outcome = match provider.refresh(&current).await {
                    Err(e) if e.is_retryable() => {
                        warn!(user_id = %uid, error = %e, "Session refresh failed transiently, retrying once");
                        provider.refresh(&current).await
                    }
                    other => other,
                };

                match outcome {
                    Ok(mut refreshed) => {
                        if refreshed.expires_at <= current.expires_at
                            || !refreshed.is_valid_at(Utc::now())
                        {
                            inner.evict_if(&uid, current.expires_at).await?;
                            return Err(ExpenseError::ReAuthenticationRequired(
                                "refresh did not extend the session".to_string(),
                            ));
                        }
                        refreshed.user_id = current.user_id.clone();
                        // Providers that do not rotate refresh tokens omit them
                        if refreshed.refresh_token.is_none() {
                            refreshed.refresh_token = current.refresh_token.clone();
                        }
                        if refreshed.claims.is_empty() {
                            refreshed.claims = current.claims.clone();
                        }
                        // A logout or a new login may have landed meanwhile
                        if !inner.replace(refreshed.clone(), current.expires_at).await? {
                            return match inner.cached(&uid) {
                                Some(newer) if newer.is_valid_at(Utc::now()) => Ok(newer),
                                _ => {
                                    debug!(user_id = %uid, "Session removed during refresh, discarding result");
                                    Err(ExpenseError::ReAuthenticationRequired(
                                        "session was removed during refresh".to_string(),
                                    ))
                                }
                            };
                        }
                        info!(
                            user_id = %uid,
                            expires_at = %refreshed.expires_at,
                            "Refreshed user session"
                        );
                        Ok(refreshed)
                    }
                    Err(e) if e.is_retryable() => Err(e),
                    Err(e) => {
                        warn!(user_id = %uid, error = %e, "Session refresh rejected, removing session");
                        inner.evict_if(&uid, current.expires_at).await?;
                        Err(match e {
                            ExpenseError::ReAuthenticationRequired(msg) => {
                                ExpenseError::ReAuthenticationRequired(msg)
                            }
                            other => ExpenseError::ReAuthenticationRequired(other.to_string()),
                        })
                    }
                }
            })
            .await
    }

    /// Health of the backing repository; an in-memory store is always healthy
    pub async fn health_check(&self) -> Result<()> {
        match &self.inner.repository {
            Some(repository) => repository.health_check().await,
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
