use super::{pick_claims, OAuthClientSettings, ProviderClient, ProviderEndpoints};
use crate::jwt::decode_claims;
use async_trait::async_trait;
use expense_core::{
    models::claims, oauth::ensure_state_matches, ExpenseError, OAuthProvider,
    PendingAuthorization, Provider, Result, StateSigner, UserSession,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

const DEFAULT_SCOPES: &str = "openid email profile";

impl ProviderEndpoints {
    pub fn google() -> Self {
        Self {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: Some("https://openidconnect.googleapis.com/v1/userinfo".to_string()),
        }
    }
}

/// Google adapter. Identity comes from the OIDC userinfo endpoint, with the
/// ID token as a fallback when userinfo is unavailable.
pub struct GoogleProvider {
    client: ProviderClient,
}

impl GoogleProvider {
    pub fn new(settings: OAuthClientSettings, signer: StateSigner) -> Result<Self> {
        let endpoints = settings
            .endpoints
            .clone()
            .unwrap_or_else(ProviderEndpoints::google);
        // offline + consent so Google issues a refresh token
        let client = ProviderClient::new(
            Provider::Google,
            &settings,
            endpoints,
            DEFAULT_SCOPES,
            &[("access_type", "offline"), ("prompt", "consent")],
            signer,
        )?;
        Ok(Self { client })
    }

    async fn identity_claims(
        &self,
        access_token: &str,
        id_token: Option<&str>,
    ) -> Result<Map<String, Value>> {
        if let Some(url) = &self.client.endpoints.userinfo_url {
            match self.client.get_with_user_token(url, access_token).await {
                Ok(Value::Object(info)) => return Ok(info),
                Ok(_) => debug!("Google userinfo was not an object"),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => debug!(error = %e, "Google userinfo unavailable, using id_token"),
            }
        }
        match id_token {
            Some(token) => decode_claims(token),
            None => Err(ExpenseError::AuthenticationFailed(
                "Google returned no identity information".to_string(),
            )),
        }
    }

    fn identity(info: &Map<String, Value>) -> Result<(String, BTreeMap<String, String>)> {
        let subject = info
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ExpenseError::AuthenticationFailed("Google identity has no subject".to_string())
            })?;
        let picked = pick_claims(
            info,
            &[
                ("sub", claims::SUBJECT),
                ("email", claims::EMAIL),
                ("name", claims::NAME),
                ("hd", "hosted_domain"),
            ],
        );
        Ok((format!("google:{subject}"), picked))
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn kind(&self) -> Option<Provider> {
        Some(Provider::Google)
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
        let info = self
            .identity_claims(&grant.access_token, grant.id_token.as_deref())
            .await?;
        let (user_id, claims) = Self::identity(&info)?;
        self.client.session_from_grant(user_id, grant, claims)
    }

    async fn refresh(&self, session: &UserSession) -> Result<UserSession> {
        let refresh_token = session.refresh_token.as_deref().ok_or_else(|| {
            ExpenseError::ReAuthenticationRequired("session has no refresh token".to_string())
        })?;
        // Google keeps the refresh token stable and omits it from refresh responses
        let grant = self.client.refresh(refresh_token).await?;
        self.client
            .session_from_grant(session.user_id.clone(), grant, BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_from_userinfo() {
        let Value::Object(info) = json!({
            "sub": "1090",
            "email": "grace@example.test",
            "name": "Grace Hopper",
            "picture": "https://example.test/p.png"
        }) else {
            unreachable!()
        };
        let (user_id, claims) = GoogleProvider::identity(&info).unwrap();
        assert_eq!(user_id, "google:1090");
        assert_eq!(claims.len(), 3);
        assert_eq!(claims[claims::EMAIL], "grace@example.test");
    }

    #[test]
    fn test_identity_requires_subject() {
        let Value::Object(info) = json!({"email": "x@example.test"}) else {
            unreachable!()
        };
        assert!(GoogleProvider::identity(&info).is_err());
    }

    #[test]
    fn test_authorization_url_requests_offline_access() {
        let signer = expense_core::SecretKey::new("k").unwrap().state_signer();
        let provider = GoogleProvider::new(
            OAuthClientSettings::new(Provider::Google, "cid", "secret"),
            signer,
        )
        .unwrap();
        let (url, _) = provider.build_authorization_url("http://localhost/cb").unwrap();
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("code_challenge_method=S256"));
    }
}
