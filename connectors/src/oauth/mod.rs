//! Microsoft and Google adapters for the [`OAuthProvider`] contract.

pub mod google;
pub mod microsoft;

pub use google::GoogleProvider;
pub use microsoft::MicrosoftProvider;

use crate::http::{build_client, error_detail, i64_field, is_transient_status, read_json, str_field, transport_error};
use chrono::{Duration, Utc};
use expense_core::{
    AuthorizationRequest, ExpenseError, NotConfigured, OAuthProvider, PendingAuthorization,
    Provider, Result, StateSigner, TokenGrant, UserSession,
};
use reqwest::{header::ACCEPT, Client};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifetime assumed when a provider omits `expires_in`
const DEFAULT_ACCESS_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Provider endpoints; overridable so tests can point at a local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: Option<String>,
}

/// Credentials and options for the user-level OAuth provider.
#[derive(Clone)]
pub struct OAuthClientSettings {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: String,
    /// Microsoft tenant; `common` when unset
    pub tenant_id: Option<String>,
    /// Space-separated scopes; provider defaults when unset
    pub scopes: Option<String>,
    pub endpoints: Option<ProviderEndpoints>,
    pub request_timeout: std::time::Duration,
}

impl OAuthClientSettings {
    pub fn new(
        provider: Provider,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            tenant_id: None,
            scopes: None,
            endpoints: None,
            request_timeout: std::time::Duration::from_secs(30),
        }
    }

    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }
}

impl fmt::Debug for OAuthClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthClientSettings")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .field("scopes", &self.scopes)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

/// Resolve the configured provider, or the `none` variant when absent
pub fn build_provider(
    settings: Option<OAuthClientSettings>,
    signer: StateSigner,
) -> Result<Arc<dyn OAuthProvider>> {
    let Some(settings) = settings else {
        return Ok(Arc::new(NotConfigured));
    };
    if !settings.is_complete() {
        warn!(provider = %settings.provider, "OAuth client credentials missing, protected tools disabled");
        return Ok(Arc::new(NotConfigured));
    }
    Ok(match settings.provider {
        Provider::Microsoft => Arc::new(MicrosoftProvider::new(settings, signer)?),
        Provider::Google => Arc::new(GoogleProvider::new(settings, signer)?),
    })
}

/// Token-endpoint plumbing shared by every provider.
#[derive(Clone)]
pub(crate) struct ProviderClient {
    pub(crate) kind: Provider,
    pub(crate) http: Client,
    pub(crate) endpoints: ProviderEndpoints,
    pub(crate) client_id: String,
    client_secret: String,
    pub(crate) scopes: String,
    pub(crate) extra_params: Vec<(String, String)>,
    signer: StateSigner,
}

impl ProviderClient {
    pub(crate) fn new(
        kind: Provider,
        settings: &OAuthClientSettings,
        endpoints: ProviderEndpoints,
        default_scopes: &str,
        extra_params: &[(&str, &str)],
        signer: StateSigner,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            http: build_client(settings.request_timeout)?,
            endpoints,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scopes: settings
                .scopes
                .clone()
                .unwrap_or_else(|| default_scopes.to_string()),
            extra_params: extra_params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            signer,
        })
    }

    pub(crate) fn authorization_url(
        &self,
        redirect_uri: &str,
    ) -> Result<(String, PendingAuthorization)> {
        let extra: Vec<(&str, &str)> = self
            .extra_params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        AuthorizationRequest {
            provider: self.kind,
            authorize_endpoint: &self.endpoints.authorize_url,
            client_id: &self.client_id,
            redirect_uri,
            scopes: &self.scopes,
            extra_params: &extra,
        }
        .build(&self.signer)
    }

    /// Authorization-code grant with the PKCE verifier
    pub(crate) async fn exchange_code(
        &self,
        code: &str,
        pending: &PendingAuthorization,
    ) -> Result<TokenGrant> {
        if code.trim().is_empty() {
            return Err(ExpenseError::AuthenticationFailed(
                "authorization code is empty".to_string(),
            ));
        }
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code_verifier", pending.pkce_verifier.as_str()),
        ];
        self.token_request(&form, |detail| {
            ExpenseError::AuthenticationFailed(format!("code exchange rejected: {detail}"))
        })
        .await
    }

    /// Refresh-token grant; any client error means the grant is unusable
    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scopes.as_str()),
        ];
        self.token_request(&form, |detail| {
            ExpenseError::ReAuthenticationRequired(format!("refresh rejected: {detail}"))
        })
        .await
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
        rejected: impl FnOnce(String) -> ExpenseError,
    ) -> Result<TokenGrant> {
        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if is_transient_status(status) {
                return Err(ExpenseError::transient(format!(
                    "{} token endpoint returned {status}",
                    self.kind
                )));
            }
            return Err(rejected(error_detail(&body)));
        }

        let body = read_json(resp).await?;
        let access_token = str_field(&body, "access_token")
            .ok_or_else(|| rejected("response has no access_token".to_string()))?;
        debug!(provider = %self.kind, "Token endpoint call succeeded");
        Ok(TokenGrant {
            access_token,
            refresh_token: str_field(&body, "refresh_token"),
            id_token: str_field(&body, "id_token"),
            expires_in: i64_field(&body, "expires_in"),
        })
    }

    /// GET a JSON document with the user's access token
    pub(crate) async fn get_with_user_token(&self, url: &str, access_token: &str) -> Result<Value> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(if is_transient_status(status) {
                ExpenseError::transient(format!("userinfo returned {status}"))
            } else {
                ExpenseError::AuthenticationFailed(format!("userinfo returned {status}"))
            });
        }
        read_json(resp).await
    }

    pub(crate) fn session_from_grant(
        &self,
        user_id: String,
        grant: TokenGrant,
        claims: BTreeMap<String, String>,
    ) -> Result<UserSession> {
        let now = Utc::now();
        let expires_at = grant
            .expires_at(now, Duration::seconds(DEFAULT_ACCESS_TOKEN_LIFETIME_SECS))
            .ok_or_else(|| {
                ExpenseError::AuthenticationFailed(format!(
                    "{} issued an unrepresentable token lifetime",
                    self.kind
                ))
            })?;
        Ok(UserSession {
            user_id,
            provider: self.kind,
            expires_at,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            claims,
        })
    }
}

/// Copy the listed string claims into the session's claim map
pub(crate) fn pick_claims(source: &Map<String, Value>, keys: &[(&str, &str)]) -> BTreeMap<String, String> {
    keys.iter()
        .filter_map(|(from, to)| {
            source
                .get(*from)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(|v| (to.to_string(), v.to_string()))
        })
        .collect()
}
