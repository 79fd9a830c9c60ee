use super::{pick_claims, OAuthClientSettings, ProviderClient, ProviderEndpoints};
use crate::jwt::decode_claims;
use async_trait::async_trait;
use expense_core::{
    models::claims, oauth::ensure_state_matches, ExpenseError, OAuthProvider,
    PendingAuthorization, Provider, Result, StateSigner, UserSession,
};
use serde_json::Value;
use std::collections::BTreeMap;

const DEFAULT_SCOPES: &str = "openid profile email offline_access User.Read";
const LOGIN_HOST: &str = "https://login.microsoftonline.com";

impl ProviderEndpoints {
    /// Microsoft identity platform v2.0 endpoints for `tenant`
    pub fn microsoft(tenant: &str) -> Self {
        let tenant = if tenant.trim().is_empty() {
            "common"
        } else {
            tenant.trim()
        };
        Self {
            authorize_url: format!("{LOGIN_HOST}/{tenant}/oauth2/v2.0/authorize"),
            token_url: format!("{LOGIN_HOST}/{tenant}/oauth2/v2.0/token"),
            userinfo_url: None,
        }
    }
}

/// Microsoft Entra ID adapter. Identity comes from the ID token's `oid`
/// (falling back to `sub`).
pub struct MicrosoftProvider {
    client: ProviderClient,
}

impl MicrosoftProvider {
    pub fn new(settings: OAuthClientSettings, signer: StateSigner) -> Result<Self> {
        let endpoints = settings.endpoints.clone().unwrap_or_else(|| {
            ProviderEndpoints::microsoft(settings.tenant_id.as_deref().unwrap_or("common"))
        });
        let client = ProviderClient::new(
            Provider::Microsoft,
            &settings,
            endpoints,
            DEFAULT_SCOPES,
            &[("response_mode", "query")],
            signer,
        )?;
        Ok(Self { client })
    }

    fn identity(id_token: Option<&str>) -> Result<(String, BTreeMap<String, String>)> {
        let id_token = id_token.ok_or_else(|| {
            ExpenseError::AuthenticationFailed("Microsoft returned no id_token".to_string())
        })?;
        let token_claims = decode_claims(id_token)?;

        let subject = ["oid", "sub"]
            .iter()
            .find_map(|key| token_claims.get(*key).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ExpenseError::AuthenticationFailed("id_token has no subject".to_string())
            })?;

        let mut picked = pick_claims(
            &token_claims,
            &[
                ("sub", claims::SUBJECT),
                ("name", claims::NAME),
                ("email", claims::EMAIL),
                ("tid", "tenant_id"),
            ],
        );
        if !picked.contains_key(claims::EMAIL) {
            if let Some(upn) = token_claims.get("preferred_username").and_then(Value::as_str) {
                picked.insert(claims::EMAIL.to_string(), upn.to_string());
            }
        }
        Ok((format!("microsoft:{subject}"), picked))
    }
}

#[async_trait]
impl OAuthProvider for MicrosoftProvider {
    fn kind(&self) -> Option<Provider> {
        Some(Provider::Microsoft)
    }

    fn build_authorization_url(
        &self,
        redirect_uri: &str,
    ) -> Result<(String, PendingAuthorization)> {
        self.client.authorization_url(redirect_uri)
    }

    async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        pending: &PendingAuthorization,
    ) -> Result<UserSession> {
        ensure_state_matches(state, pending)?;
        let grant = self.client.exchange_code(code, pending).await?;
        let (user_id, claims) = Self::identity(grant.id_token.as_deref())?;
        self.client.session_from_grant(user_id, grant, claims)
    }

    async fn refresh(&self, session: &UserSession) -> Result<UserSession> {
        let refresh_token = session.refresh_token.as_deref().ok_or_else(|| {
            ExpenseError::ReAuthenticationRequired("session has no refresh token".to_string())
        })?;
        let grant = self.client.refresh(refresh_token).await?;
        let claims = Self::identity(grant.id_token.as_deref())
            .map(|(_, claims)| claims)
            .unwrap_or_default();
        self.client
            .session_from_grant(session.user_id.clone(), grant, claims)
    }
}
