use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use expense_connectors::OAuthClientSettings;
use expense_core::Provider;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub oauth: OAuthConfig,
    pub sessions: SessionsConfig,
    pub retry: RetryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    /// Defaults to `<base_url>/oauth2/v0/token`
    pub token_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
    /// Service tokens are renewed this long before they expire
    pub token_safety_margin_secs: i64,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct OAuthConfig {
    pub provider: OAuthProviderKind,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Microsoft tenant, `common` when unset
    pub tenant_id: Option<String>,
    /// Defaults to `http://<listen_addr>:<port>/oauth/callback`
    pub redirect_uri: Option<String>,
    /// Space-separated scopes, provider defaults when unset
    pub scopes: Option<String>,
    pub pending_ttl_secs: i64,
    /// Root secret for state signing and token encryption
    pub secret_key: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionsConfig {
    /// Keep user sessions in SQLite so they survive restarts
    pub persist: bool,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub transport: Transport,
    /// Listen address of the HTTP transport and the OAuth callback
    pub listen_addr: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

/// Configured identity provider, including the `none` variant
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProviderKind {
    #[default]
    None,
    Microsoft,
    Google,
}

impl OAuthProviderKind {
    pub fn provider(self) -> Option<Provider> {
        match self {
            Self::None => None,
            Self::Microsoft => Some(Provider::Microsoft),
            Self::Google => Some(Provider::Google),
        }
    }
}

impl FromStr for OAuthProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "microsoft" => Ok(Self::Microsoft),
            "google" => Ok(Self::Google),
            other => Err(anyhow::anyhow!(
                "Invalid OAuth provider: {other}. Must be one of: none, microsoft, google"
            )),
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("token_safety_margin_secs", &self.token_safety_margin_secs)
            .finish()
    }
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("provider", &self.provider)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("tenant_id", &self.tenant_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("pending_ttl_secs", &self.pending_ttl_secs)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load configuration from the defaults, `CONFIG_FILE` and the environment
    pub fn from_env() -> Result<Self> {
        let file = env::var("CONFIG_FILE").ok();
        Self::load(file.as_deref())
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).format(FileFormat::Toml));
        }

        // EXPENSE_BACKEND__CLIENT_ID -> backend.client_id
        builder = builder.add_source(
            Environment::with_prefix("EXPENSE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut result: Config = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        result.apply_standard_env_vars(|name| env::var(name).ok())?;
        Ok(result)
    }

    /// Apply the deployment variables the server has always understood
    /// (`CONCUR_*`, `OAUTH_PROVIDER`, `MICROSOFT_*`, `GOOGLE_*`, ...)
    pub fn apply_standard_env_vars<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("CONCUR_BASE_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = var("CONCUR_CLIENT_ID") {
            self.backend.client_id = v;
        }
        if let Some(v) = var("CONCUR_CLIENT_SECRET") {
            self.backend.client_secret = v;
        }
        if let Some(v) = var("CONCUR_USERNAME") {
            self.backend.username = v;
        }
        if let Some(v) = var("CONCUR_PASSWORD") {
            self.backend.password = v;
        }

        if let Some(v) = var("OAUTH_PROVIDER") {
            self.oauth.provider = v.parse()?;
        }
        let prefix = match self.oauth.provider {
            OAuthProviderKind::Microsoft => Some("MICROSOFT"),
            OAuthProviderKind::Google => Some("GOOGLE"),
            OAuthProviderKind::None => None,
        };
        if let Some(prefix) = prefix {
            if let Some(v) = var(&format!("{prefix}_CLIENT_ID")) {
                self.oauth.client_id = Some(v);
            }
            if let Some(v) = var(&format!("{prefix}_CLIENT_SECRET")) {
                self.oauth.client_secret = Some(v);
            }
        }
        if self.oauth.provider == OAuthProviderKind::Microsoft {
            if let Some(v) = var("MICROSOFT_TENANT_ID") {
                self.oauth.tenant_id = Some(v);
            }
        }
        if let Some(v) = var("OAUTH_REDIRECT_URI") {
            self.oauth.redirect_uri = Some(v);
        }
        if let Some(v) = var("SECRET_KEY") {
            self.oauth.secret_key = Some(v);
        }

        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LISTEN_ADDR") {
            self.set_listen_addr(&v);
        }
        Ok(())
    }

    /// Accepts either `host` or `host:port`
    pub fn set_listen_addr(&mut self, value: &str) {
        if let Some((host, port)) = value.rsplit_once(':') {
            if let (false, Ok(port)) = (host.is_empty() || host.ends_with(':'), port.parse::<u16>()) {
                self.server.listen_addr = host.to_string();
                self.server.port = port;
                return;
            }
        }
        self.server.listen_addr = value.to_string();
    }

    /// Get the server socket address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    pub fn redirect_uri(&self) -> String {
        if let Some(uri) = &self.oauth.redirect_uri {
            return uri.clone();
        }
        let host = match self.server.listen_addr.as_str() {
            "0.0.0.0" | "127.0.0.1" | "::" | "::1" => "localhost",
            other => other,
        };
        format!("http://{host}:{}/oauth/callback", self.server.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout_secs)
    }

    /// Secret key, if one is configured
    pub fn secret_key(&self) -> Option<&str> {
        self.oauth
            .secret_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }

    /// Provider settings, or `None` when user login is off or incomplete
    ///
    /// An incomplete setup logs a warning and degrades to the `none` provider
    /// so public tools keep working.
    pub fn oauth_client_settings(&self) -> Option<OAuthClientSettings> {
        let provider = self.oauth.provider.provider()?;

        let client_id = self.oauth.client_id.clone().unwrap_or_default();
        let client_secret = self.oauth.client_secret.clone().unwrap_or_default();
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            warn!(
                provider = %provider,
                "OAuth client id or secret missing, user login disabled"
            );
            return None;
        }
        if self.secret_key().is_none() {
            warn!(
                provider = %provider,
                "SECRET_KEY missing, user login disabled"
            );
            return None;
        }

        let mut settings = OAuthClientSettings::new(provider, client_id, client_secret);
        settings.tenant_id = self.oauth.tenant_id.clone();
        settings.scopes = self.oauth.scopes.clone();
        settings.request_timeout = self.request_timeout();
        Some(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        let backend = &self.backend;
        let missing: Vec<&str> = [
            ("client_id", &backend.client_id),
            ("client_secret", &backend.client_secret),
            ("username", &backend.username),
            ("password", &backend.password),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "Missing backend credentials: {}. Set CONCUR_CLIENT_ID, CONCUR_CLIENT_SECRET, CONCUR_USERNAME and CONCUR_PASSWORD",
                missing.join(", ")
            ));
        }

        if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "Backend base_url must be an http(s) URL. Got: {}",
                backend.base_url
            ));
        }

        if backend.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Backend request_timeout_secs must be greater than 0"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("Retry max_attempts must be greater than 0"));
        }

        if self.oauth.pending_ttl_secs <= 0 {
            return Err(anyhow::anyhow!("OAuth pending_ttl_secs must be greater than 0"));
        }

        if self.sessions.persist && self.secret_key().is_none() {
            return Err(anyhow::anyhow!(
                "Session persistence requires SECRET_KEY to encrypt stored tokens"
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                base_url: expense_connectors::concur::DEFAULT_BASE_URL.to_string(),
                token_url: None,
                client_id: String::new(),
                client_secret: String::new(),
                username: String::new(),
                password: String::new(),
                request_timeout_secs: 30,
                token_safety_margin_secs: 60,
            },
            oauth: OAuthConfig {
                provider: OAuthProviderKind::None,
                client_id: None,
                client_secret: None,
                tenant_id: None,
                redirect_uri: None,
                scopes: None,
                pending_ttl_secs: 600,
                secret_key: None,
            },
            sessions: SessionsConfig {
                persist: false,
                database_url: "sqlite://expense-mcp-sessions.sqlite".to_string(),
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 200,
                max_delay_ms: 2000,
            },
            server: ServerConfig {
                transport: Transport::Stdio,
                listen_addr: "127.0.0.1".to_string(),
                port: 8080,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_credentials() -> Config {
        let mut config = Config::default();
        config.backend.client_id = "cid".to_string();
        config.backend.client_secret = "csecret".to_string();
        config.backend.username = "svc@example.test".to_string();
        config.backend.password = "pw".to_string();
        config
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_embedded_defaults_match_default_impl() {
        let embedded: Config = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        let default = Config::default();

        assert_eq!(embedded.backend.base_url, default.backend.base_url);
        assert_eq!(embedded.server.port, default.server.port);
        assert_eq!(embedded.server.transport, Transport::Stdio);
        assert_eq!(embedded.oauth.provider, OAuthProviderKind::None);
        assert_eq!(embedded.oauth.pending_ttl_secs, 600);
        assert_eq!(embedded.retry.max_attempts, 3);
        assert_eq!(embedded.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_config_validation() {
        assert!(with_credentials().validate().is_ok());

        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("client_id"));

        let mut invalid = with_credentials();
        invalid.logging.level = "invalid".to_string();
        assert!(invalid.validate().is_err());

        let mut invalid = with_credentials();
        invalid.server.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = with_credentials();
        invalid.sessions.persist = true;
        assert!(invalid.validate().unwrap_err().to_string().contains("SECRET_KEY"));

        invalid.oauth.secret_key = Some("s3cret".to_string());
        assert!(invalid.validate().is_ok());
    }

    #[test]
    fn test_standard_env_vars() {
        let mut config = Config::default();
        config
            .apply_standard_env_vars(lookup(&[
                ("CONCUR_CLIENT_ID", "cid"),
                ("CONCUR_CLIENT_SECRET", "csecret"),
                ("CONCUR_USERNAME", "svc"),
                ("CONCUR_PASSWORD", "pw"),
                ("OAUTH_PROVIDER", "Microsoft"),
                ("MICROSOFT_CLIENT_ID", "ms-id"),
                ("MICROSOFT_CLIENT_SECRET", "ms-secret"),
                ("MICROSOFT_TENANT_ID", "contoso"),
                ("GOOGLE_CLIENT_ID", "ignored"),
                ("SECRET_KEY", "k"),
                ("LOG_LEVEL", "debug"),
                ("LISTEN_ADDR", "0.0.0.0:9000"),
            ]))
            .unwrap();

        assert_eq!(config.backend.client_id, "cid");
        assert_eq!(config.oauth.provider, OAuthProviderKind::Microsoft);
        assert_eq!(config.oauth.client_id.as_deref(), Some("ms-id"));
        assert_eq!(config.oauth.tenant_id.as_deref(), Some("contoso"));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server_address(), "0.0.0.0:9000");
        assert_eq!(config.redirect_uri(), "http://localhost:9000/oauth/callback");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_provider_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_standard_env_vars(lookup(&[("OAUTH_PROVIDER", "github")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_listen_addr_without_port() {
        let mut config = Config::default();
        config.set_listen_addr("10.0.0.5");
        assert_eq!(config.server_address(), "10.0.0.5:8080");
    }

    #[test]
    fn test_incomplete_oauth_degrades_to_none() {
        let mut config = with_credentials();
        assert!(config.oauth_client_settings().is_none());

        config.oauth.provider = OAuthProviderKind::Google;
        config.oauth.client_id = Some("g-id".to_string());
        assert!(config.oauth_client_settings().is_none());

        config.oauth.client_secret = Some("g-secret".to_string());
        assert!(config.oauth_client_settings().is_none(), "secret key still missing");

        config.oauth.secret_key = Some("k".to_string());
        let settings = config.oauth_client_settings().unwrap();
        assert_eq!(settings.provider, Provider::Google);
        assert_eq!(settings.client_id, "g-id");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = with_credentials();
        config.oauth.secret_key = Some("root-secret".to_string());
        config.oauth.client_secret = Some("oauth-secret".to_string());

        let debug = format!("{config:?}");
        assert!(!debug.contains("csecret"));
        assert!(!debug.contains("root-secret"));
        assert!(!debug.contains("oauth-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
