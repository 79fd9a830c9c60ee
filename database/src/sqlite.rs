use crate::common::{claims_to_json, row_to_session, sqlx_error_to_storage_error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use expense_core::{ExpenseError, Result, SessionRepository, TokenCipher, UserSession};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// SQLite implementation of the [`SessionRepository`] trait
///
/// Access and refresh tokens are sealed with a [`TokenCipher`] before they
/// are written, so the database file never holds usable credentials.
#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: SqlitePool,
    cipher: TokenCipher,
}

impl SqliteSessionRepository {
    /// Create a new SQLite repository with the given database URL
    ///
    /// # Arguments
    /// * `database_url` - SQLite database URL (file path, `sqlite://...` or `:memory:`)
    /// * `cipher` - cipher used to seal tokens at rest
    ///
    /// # Returns
    /// * `Ok(SqliteSessionRepository)` - Successfully connected repository
    /// * `Err(ExpenseError::Storage)` - If the database cannot be created or opened
    pub async fn new(database_url: &str, cipher: TokenCipher) -> Result<Self> {
        if database_url.contains(":memory:") {
            // One long-lived connection, otherwise each pooled connection
            // would see its own empty database
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(sqlx_error_to_storage_error)?
                .journal_mode(SqliteJournalMode::Memory);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
                .map_err(sqlx_error_to_storage_error)?;
            return Ok(Self { pool, cipher });
        }

        let db_url = if database_url.starts_with("sqlite://") {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            match Sqlite::create_database(&db_url).await {
                Ok(_) => tracing::info!("Session database created"),
                Err(error) => {
                    tracing::error!("Error creating session database: {}", error);
                    return Err(ExpenseError::Storage(format!(
                        "Failed to create database: {error}"
                    )));
                }
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_url.trim_start_matches("sqlite://"))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(sqlx_error_to_storage_error)?;

        Ok(Self { pool, cipher })
    }

    /// Run database migrations
    ///
    /// # Returns
    /// * `Ok(())` - Migrations completed successfully
    /// * `Err(ExpenseError::Storage)` - If migration fails
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| ExpenseError::Storage(format!("Migration failed: {e}")))?;

        tracing::info!("Session database migrations completed");
        Ok(())
    }

    /// Delete sessions that are expired and carry no refresh token
    ///
    /// Such sessions can never become valid again.
    pub async fn purge_unrefreshable(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM user_sessions WHERE refresh_token IS NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_storage_error)?;
        Ok(result.rows_affected())
    }

    /// Get access to the underlying pool, mainly for tests
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl fmt::Debug for SqliteSessionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteSessionRepository")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn load_all(&self) -> Result<Vec<UserSession>> {
        let rows = sqlx::query("SELECT * FROM user_sessions ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            // Rows sealed under a previous key are skipped, not fatal
            match row_to_session(row, &self.cipher) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(error = %e, "Skipping unreadable stored session"),
            }
        }
        debug!(count = sessions.len(), "Loaded stored sessions");
        Ok(sessions)
    }

    async fn load(&self, user_id: &str) -> Result<Option<UserSession>> {
        let row = sqlx::query("SELECT * FROM user_sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;

        row.map(|row| row_to_session(&row, &self.cipher)).transpose()
    }

    async fn save(&self, session: &UserSession) -> Result<()> {
        if session.user_id.trim().is_empty() {
            return Err(ExpenseError::Storage(
                "Cannot store a session without a user id".to_string(),
            ));
        }
        let access_token = self.cipher.seal(&session.access_token)?;
        let refresh_token = session
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.seal(t))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO user_sessions
                (user_id, provider, access_token, refresh_token, expires_at, claims, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                provider = excluded.provider,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                claims = excluded.claims,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.user_id)
        .bind(session.provider.as_str())
        .bind(access_token)
        .bind(refresh_token)
        .bind(session.expires_at)
        .bind(claims_to_json(&session.claims)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_storage_error)?;

        debug!(user_id = %session.user_id, "Stored session");
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_storage_error)?;
        Ok(())
    }
}
