use super::{OAuthProvider, PendingAuthorizations};
use crate::{
    crypto::StateSigner,
    error::{ExpenseError, Result},
    models::{Provider, UserSession},
    session_store::UserSessionStore,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connection to user bindings kept at most; the oldest is dropped first
pub const DEFAULT_MAX_BINDINGS: usize = 4096;

struct Binding {
    user_id: String,
    bound_at: DateTime<Utc>,
}

/// Drives the authorization-code flow end to end.
///
/// Starting a login records a [`PendingAuthorization`](crate::models::PendingAuthorization);
/// completing it verifies the signed `state`, consumes the pending record,
/// exchanges the code, stores the session and binds the originating
/// connection to the authenticated user.
pub struct AuthorizationFlow {
    provider: Arc<dyn OAuthProvider>,
    pending: PendingAuthorizations,
    sessions: Arc<UserSessionStore>,
    signer: Option<StateSigner>,
    redirect_uri: String,
    bindings: RwLock<HashMap<String, Binding>>,
    max_bindings: usize,
}

impl AuthorizationFlow {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        sessions: Arc<UserSessionStore>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            pending: PendingAuthorizations::default(),
            sessions,
            signer: None,
            redirect_uri: redirect_uri.into(),
            bindings: RwLock::new(HashMap::new()),
            max_bindings: DEFAULT_MAX_BINDINGS,
        }
    }

    /// Flow for the `none` provider: every login attempt fails with
    /// `OAuthNotConfigured`
    pub fn disabled(sessions: Arc<UserSessionStore>) -> Self {
        Self::new(Arc::new(super::NotConfigured), sessions, String::new())
    }

    /// Reject callback states that were not signed with this key
    pub fn with_state_signer(mut self, signer: StateSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_max_bindings(mut self, max_bindings: usize) -> Self {
        self.max_bindings = max_bindings.max(1);
        self
    }

    pub fn with_pending_store(mut self, pending: PendingAuthorizations) -> Self {
        self.pending = pending;
        self
    }

    pub fn provider(&self) -> Arc<dyn OAuthProvider> {
        self.provider.clone()
    }

    pub fn provider_kind(&self) -> Option<Provider> {
        self.provider.kind()
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_configured()
    }

    pub fn sessions(&self) -> &Arc<UserSessionStore> {
        &self.sessions
    }

    pub fn pending(&self) -> &PendingAuthorizations {
        &self.pending
    }

    /// Start a login and return the browser URL
    pub fn begin(&self, connection_id: Option<&str>) -> Result<String> {
        let (url, mut pending) = self.provider.build_authorization_url(&self.redirect_uri)?;
        pending.connection_id = connection_id.map(str::to_string);
        info!(
            provider = %pending.provider,
            connection_id = connection_id.unwrap_or("-"),
            "Started OAuth login"
        );
        self.pending.insert(pending);
        Ok(url)
    }

    /// Finish a login from the provider callback
    ///
    /// # Returns
    /// * `Err(ExpenseError::AuthenticationFailed)` - forged, unknown, expired or reused state,
    ///   or the provider rejected the code. No session is created.
    /// * `Err(ExpenseError::OAuthNotConfigured)` - no provider configured
    pub async fn complete(&self, state: &str, code: &str) -> Result<UserSession> {
        if !self.is_configured() {
            return Err(ExpenseError::OAuthNotConfigured);
        }
        if let Some(signer) = &self.signer {
            if !signer.verify(state) {
                warn!("Rejected OAuth callback with unsigned state");
                return Err(ExpenseError::AuthenticationFailed(
                    "state signature is invalid".to_string(),
                ));
            }
        }

        let pending = self.pending.take(state)?;
        let session = self
            .provider
            .exchange_code(code, state, &pending)
            .await
            .inspect_err(|e| warn!(error = %e, "Authorization code exchange failed"))?;

        if session.user_id.is_empty() {
            return Err(ExpenseError::AuthenticationFailed(
                "provider returned no user identity".to_string(),
            ));
        }

        self.sessions.put(session.clone()).await?;
        if let Some(connection_id) = pending.connection_id {
            self.bind(&connection_id, &session.user_id);
        }
        info!(user_id = %session.user_id, provider = %session.provider, "Completed OAuth login");
        Ok(session)
    }

    pub fn bind(&self, connection_id: &str, user_id: &str) {
        let mut bindings = self.bindings.write();
        if !bindings.contains_key(connection_id) {
            while bindings.len() >= self.max_bindings {
                let oldest = bindings
                    .iter()
                    .min_by_key(|(_, b)| b.bound_at)
                    .map(|(conn, _)| conn.clone());
                match oldest {
                    Some(conn) => {
                        bindings.remove(&conn);
                        debug!("Dropped oldest connection binding at capacity");
                    }
                    None => break,
                }
            }
        }
        bindings.insert(
            connection_id.to_string(),
            Binding {
                user_id: user_id.to_string(),
                bound_at: Utc::now(),
            },
        );
    }

    /// Authenticated user bound to a connection, if any
    pub fn user_for(&self, connection_id: &str) -> Option<String> {
        self.bindings
            .read()
            .get(connection_id)
            .map(|b| b.user_id.clone())
    }

    /// Drop every connection bound to `user_id`, returning how many were bound
    pub fn unbind_user(&self, user_id: &str) -> usize {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|_, b| b.user_id != user_id);
        before - bindings.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.read().len()
    }

    /// Unbind the connection and destroy its session
    pub async fn logout(&self, connection_id: &str) -> Result<bool> {
        let Some(user_id) = self.user_for(connection_id) else {
            return Ok(false);
        };
        self.unbind_user(&user_id);
        let removed = self.sessions.remove(&user_id).await?;
        info!(user_id = %user_id, "Logged out user");
        Ok(removed.is_some())
    }
}
