use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use database::SqliteSessionRepository;
use expense_connectors::{build_provider, ConcurClient, ConcurConfig};
use expense_core::{
    oauth::pending::DEFAULT_MAX_PENDING, AuthorizationFlow, AuthorizedBackend,
    BackendTokenManager, Dispatcher, ExpenseBackend, NotConfigured, OAuthProvider,
    PendingAuthorizations, RetryPolicy, SecretKey, TokenEndpoint, UserSessionStore,
};
use mcp_protocol::default_registry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::Config;

/// Interval between sweeps of expired pending logins
pub const PENDING_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Create the expense backend client from configuration
pub fn create_backend(config: &Config) -> Result<Arc<ConcurClient>> {
    let backend = &config.backend;
    let mut concur = ConcurConfig::new(
        &backend.client_id,
        &backend.client_secret,
        &backend.username,
        &backend.password,
    )
    .with_base_url(&backend.base_url)
    .with_timeout(config.request_timeout());
    concur.token_url = backend.token_url.clone();

    info!(base_url = %concur.base_url, token_url = %concur.token_url(), "Creating backend client");
    let client = ConcurClient::new(concur).context("Failed to create backend client")?;
    Ok(Arc::new(client))
}

/// Create the user session store, persistent when configured
///
/// A persistent store is hydrated from SQLite after expired sessions that
/// cannot be refreshed have been purged.
pub async fn create_session_store(
    config: &Config,
    secret: Option<&SecretKey>,
) -> Result<Arc<UserSessionStore>> {
    if !config.sessions.persist {
        info!("User sessions are kept in memory only");
        return Ok(Arc::new(UserSessionStore::in_memory()));
    }
    let secret = secret.context("Session persistence requires SECRET_KEY")?;

    let database_url = &config.sessions.database_url;
    ensure_database_directory(database_url).context("Failed to create database directory")?;

    info!(database_url = %database_url, "Opening session database");
    let repo = SqliteSessionRepository::new(database_url, secret.token_cipher())
        .await
        .context("Failed to create SQLite session repository")?;
    repo.migrate()
        .await
        .context("Failed to run database migrations")?;

    let purged = repo
        .purge_unrefreshable(Utc::now())
        .await
        .context("Failed to purge expired sessions")?;
    if purged > 0 {
        info!(purged, "Removed expired sessions without refresh token");
    }

    let store = UserSessionStore::with_repository(Arc::new(repo));
    let loaded = store
        .hydrate()
        .await
        .context("Failed to load stored sessions")?;
    info!(sessions = loaded, "User sessions restored");
    Ok(Arc::new(store))
}

/// Assemble the dispatcher from its collaborators
pub fn create_dispatcher(
    config: &Config,
    backend: Arc<dyn ExpenseBackend>,
    endpoint: Arc<dyn TokenEndpoint>,
    provider: Arc<dyn OAuthProvider>,
    sessions: Arc<UserSessionStore>,
    secret: Option<&SecretKey>,
) -> Result<Dispatcher> {
    let tokens = Arc::new(
        BackendTokenManager::new(endpoint).with_safety_margin(ChronoDuration::seconds(
            config.backend.token_safety_margin_secs,
        )),
    );

    let retry = RetryPolicy::new(
        config.retry.max_attempts,
        Duration::from_millis(config.retry.base_delay_ms),
        Duration::from_millis(config.retry.max_delay_ms),
    );

    let flow = if provider.kind().is_some() {
        let pending = PendingAuthorizations::new(
            ChronoDuration::seconds(config.oauth.pending_ttl_secs),
            DEFAULT_MAX_PENDING,
        );
        let mut flow = AuthorizationFlow::new(provider, sessions, config.redirect_uri())
            .with_pending_store(pending);
        if let Some(secret) = secret {
            flow = flow.with_state_signer(secret.state_signer());
        }
        flow
    } else {
        AuthorizationFlow::disabled(sessions)
    };

    let registry = default_registry().context("Failed to register tools")?;
    info!(
        tools = registry.len(),
        oauth_configured = flow.is_configured(),
        "Tool dispatcher ready"
    );

    Ok(Dispatcher::new(
        Arc::new(registry),
        AuthorizedBackend::new(backend, tokens, retry),
        Arc::new(flow),
    ))
}

/// Initialize the complete application
pub async fn initialize_app(config: &Config) -> Result<Arc<Dispatcher>> {
    info!("Initializing application");

    let secret = config
        .secret_key()
        .map(SecretKey::new)
        .transpose()
        .context("Invalid secret key")?;

    // `oauth_client_settings` already degrades to `None` without a secret key
    let provider: Arc<dyn OAuthProvider> = match (config.oauth_client_settings(), &secret) {
        (Some(settings), Some(secret)) => build_provider(Some(settings), secret.state_signer())
            .context("Failed to create OAuth provider")?,
        _ => Arc::new(NotConfigured),
    };

    let backend = create_backend(config)?;
    let sessions = create_session_store(config, secret.as_ref()).await?;

    let dispatcher = create_dispatcher(
        config,
        backend.clone(),
        backend,
        provider,
        sessions,
        secret.as_ref(),
    )?;

    info!("Application initialized successfully");
    Ok(Arc::new(dispatcher))
}

/// Periodically drop pending logins that outlived their TTL
///
/// Abandoned logins are otherwise only purged when the next login starts.
pub fn spawn_pending_purge(dispatcher: Arc<Dispatcher>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let purged = dispatcher.flow().pending().purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired pending logins");
            }
        }
    })
}

/// Ensure the database directory exists and set secure permissions
pub fn ensure_database_directory(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") {
        return Ok(());
    }
    let db_path = Path::new(database_url.strip_prefix("sqlite://").unwrap_or(database_url));

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            info!("Creating database directory: {}", parent.display());
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let permissions = std::fs::Permissions::from_mode(0o700);
                std::fs::set_permissions(parent, permissions)
                    .context("Failed to set directory permissions")?;
            }
        }
    }

    // The file holds sealed tokens; keep it owner-only anyway
    if db_path.exists() {
        set_secure_file_permissions(db_path)?;
    }
    Ok(())
}

/// Set secure file permissions (owner-only access on Unix)
fn set_secure_file_permissions(file_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(file_path, permissions)
            .with_context(|| format!("Failed to set permissions for {}", file_path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = file_path;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthProviderKind;
    use expense_core::{CallerContext, ErrorKind};
    use mocks::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.backend.client_id = "cid".to_string();
        config.backend.client_secret = "csecret".to_string();
        config.backend.username = "svc".to_string();
        config.backend.password = "pw".to_string();
        config.retry.max_attempts = 1;
        config
    }

    #[test]
    fn test_ensure_database_directory() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("sessions.sqlite");
        let url = format!("sqlite://{}", db_path.display());

        ensure_database_directory(&url).unwrap();
        assert!(db_path.parent().unwrap().exists());

        ensure_database_directory("sqlite::memory:").unwrap();
    }

    #[test]
    fn test_create_backend_uses_configured_urls() {
        let mut config = test_config();
        config.backend.base_url = "http://127.0.0.1:9".to_string();
        let client = create_backend(&config).unwrap();
        assert_eq!(client.config().token_url(), "http://127.0.0.1:9/oauth2/v0/token");

        config.backend.token_url = Some("http://auth.test/token".to_string());
        let client = create_backend(&config).unwrap();
        assert_eq!(client.config().token_url(), "http://auth.test/token");
    }

    #[tokio::test]
    async fn test_persistent_store_purges_and_hydrates() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("sessions.sqlite");
        let mut config = test_config();
        config.sessions.persist = true;
        config.sessions.database_url = format!("sqlite://{}", db_path.display());
        let secret = SecretKey::new("test-secret").unwrap();

        let store = create_session_store(&config, Some(&secret)).await.unwrap();
        store.put(create_valid_session("google:alice")).await.unwrap();
        store
            .put(create_expired_session("google:bob", false))
            .await
            .unwrap();
        drop(store);

        let store = create_session_store(&config, Some(&secret)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("google:alice").await.unwrap().is_some());
        assert!(store.get("google:bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_requires_secret() {
        let mut config = test_config();
        config.sessions.persist = true;
        config.sessions.database_url = "sqlite::memory:".to_string();

        assert!(create_session_store(&config, None).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_without_oauth_serves_public_tools() {
        let config = test_config();
        let backend = MockExpenseBackend::with_reports(create_test_reports(3));
        let sessions = Arc::new(UserSessionStore::in_memory());

        let dispatcher = create_dispatcher(
            &config,
            Arc::new(backend.clone()),
            Arc::new(MockTokenEndpoint::new()),
            Arc::new(NotConfigured),
            sessions,
            None,
        )
        .unwrap();

        assert!(!dispatcher.flow().is_configured());
        let caller = CallerContext::new("conn-1");
        let result = dispatcher
            .invoke("list_reports_public", json!({}), &caller)
            .await
            .unwrap();
        assert_eq!(result["count"], 3);

        let err = dispatcher
            .invoke("get_user_profile", json!({}), &caller)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OauthNotConfigured);
    }

    #[tokio::test]
    async fn test_dispatcher_with_oauth_issues_login_url() {
        let mut config = test_config();
        config.oauth.provider = OAuthProviderKind::Google;
        config.oauth.pending_ttl_secs = 60;
        let provider = MockOAuthProvider::google();
        let secret = SecretKey::new("test-secret").unwrap();

        let dispatcher = create_dispatcher(
            &config,
            Arc::new(MockExpenseBackend::with_reports(create_test_reports(1))),
            Arc::new(MockTokenEndpoint::new()),
            Arc::new(provider),
            Arc::new(UserSessionStore::in_memory()),
            Some(&secret),
        )
        .unwrap();

        assert!(dispatcher.flow().is_configured());
        assert_eq!(dispatcher.flow().pending().ttl(), ChronoDuration::seconds(60));

        let err = dispatcher
            .invoke("get_user_profile", json!({}), &CallerContext::new("conn-2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationRequired);
        assert!(err.login_url.is_some());
    }

    #[tokio::test]
    async fn test_pending_purge_drops_abandoned_logins() {
        let mut config = test_config();
        config.oauth.provider = OAuthProviderKind::Google;
        config.oauth.pending_ttl_secs = 1;
        let secret = SecretKey::new("test-secret").unwrap();

        let dispatcher = Arc::new(
            create_dispatcher(
                &config,
                Arc::new(MockExpenseBackend::new()),
                Arc::new(MockTokenEndpoint::new()),
                Arc::new(MockOAuthProvider::google()),
                Arc::new(UserSessionStore::in_memory()),
                Some(&secret),
            )
            .unwrap(),
        );
        dispatcher.flow().begin(Some("conn-3")).unwrap();
        assert_eq!(dispatcher.flow().pending().len(), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let purge = spawn_pending_purge(dispatcher.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        purge.abort();

        assert!(dispatcher.flow().pending().is_empty());
    }
}
