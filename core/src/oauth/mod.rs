//! User-level OAuth: the provider contract, the `none` variant, PKCE,
//! pending logins and the authorization flow that ties them to sessions.

pub mod flow;
pub mod pending;
pub mod pkce;

use crate::{
    crypto::StateSigner,
    error::{ExpenseError, Result},
    models::{PendingAuthorization, Provider, UserSession},
};
use async_trait::async_trait;
use chrono::Utc;
use url::Url;

pub use flow::AuthorizationFlow;
pub use pending::PendingAuthorizations;
pub use pkce::PkcePair;

/// Contract shared by every identity provider adapter.
///
/// Implementations must be thread-safe. The `none` variant
/// ([`NotConfigured`]) fails every operation with
/// [`ExpenseError::OAuthNotConfigured`].
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Provider variant, `None` when OAuth is not configured
    fn kind(&self) -> Option<Provider>;

    fn is_configured(&self) -> bool {
        self.kind().is_some()
    }

    /// Build the browser login URL and the pending record that must accompany
    /// the later code exchange
    fn build_authorization_url(&self, redirect_uri: &str)
        -> Result<(String, PendingAuthorization)>;

    /// Exchange an authorization code for a user session
    ///
    /// # Returns
    /// * `Err(ExpenseError::AuthenticationFailed)` - state mismatch or provider refused the code
    /// * `Err(ExpenseError::TransientNetwork)` - provider unreachable
    async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        pending: &PendingAuthorization,
    ) -> Result<UserSession>;

    /// Mint a new access token from the session's refresh token
    ///
    /// # Returns
    /// * `Err(ExpenseError::ReAuthenticationRequired)` - refresh token invalid or revoked
    async fn refresh(&self, session: &UserSession) -> Result<UserSession>;
}

/// The `none` variant: protected tools are unavailable, public tools unaffected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotConfigured;

#[async_trait]
impl OAuthProvider for NotConfigured {
    fn kind(&self) -> Option<Provider> {
        None
    }

    fn build_authorization_url(&self, _: &str) -> Result<(String, PendingAuthorization)> {
        Err(ExpenseError::OAuthNotConfigured)
    }

    async fn exchange_code(
        &self,
        _: &str,
        _: &str,
        _: &PendingAuthorization,
    ) -> Result<UserSession> {
        Err(ExpenseError::OAuthNotConfigured)
    }

    async fn refresh(&self, _: &UserSession) -> Result<UserSession> {
        Err(ExpenseError::OAuthNotConfigured)
    }
}

/// Parameters of an authorization-code request with PKCE.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest<'a> {
    pub provider: Provider,
    pub authorize_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scopes: &'a str,
    /// Provider-specific query parameters (e.g. `prompt`, `access_type`)
    pub extra_params: &'a [(&'a str, &'a str)],
}

impl AuthorizationRequest<'_> {
    /// Generate a signed `state` and PKCE pair, returning the login URL and
    /// the pending record holding the verifier
    pub fn build(&self, signer: &StateSigner) -> Result<(String, PendingAuthorization)> {
        let state = signer.issue()?;
        let pkce = PkcePair::generate();

        let mut url = Url::parse(self.authorize_endpoint).map_err(|e| {
            ExpenseError::Configuration(format!("invalid authorization endpoint: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri)
            .append_pair("scope", self.scopes)
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD)
            .extend_pairs(self.extra_params.iter().copied());

        let pending = PendingAuthorization {
            state,
            provider: self.provider,
            created_at: Utc::now(),
            pkce_verifier: pkce.verifier,
            redirect_uri: self.redirect_uri.to_string(),
            connection_id: None,
        };
        Ok((url.into(), pending))
    }
}

/// Reject a code exchange whose `state` does not belong to `pending`
pub fn ensure_state_matches(state: &str, pending: &PendingAuthorization) -> Result<()> {
    if state.is_empty() || state != pending.state {
        return Err(ExpenseError::AuthenticationFailed(
            "state does not match the pending login".to_string(),
        ));
    }
    Ok(())
}
