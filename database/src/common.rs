use chrono::{DateTime, Utc};
use expense_core::{ExpenseError, Provider, Result, TokenCipher, UserSession};
use sqlx::{sqlite::SqliteRow, Row};
use std::collections::BTreeMap;

/// Convert a stored row back into a session, opening the sealed tokens
pub fn row_to_session(row: &SqliteRow, cipher: &TokenCipher) -> Result<UserSession> {
    let user_id: String = row.try_get("user_id").map_err(sqlx_error_to_storage_error)?;
    let provider: String = row.try_get("provider").map_err(sqlx_error_to_storage_error)?;
    let provider = provider.parse::<Provider>().map_err(|_| {
        ExpenseError::Storage(format!("Invalid provider in database: {provider}"))
    })?;

    let access_token: String = row
        .try_get("access_token")
        .map_err(sqlx_error_to_storage_error)?;
    let refresh_token: Option<String> = row
        .try_get("refresh_token")
        .map_err(sqlx_error_to_storage_error)?;
    let expires_at: DateTime<Utc> = row
        .try_get("expires_at")
        .map_err(sqlx_error_to_storage_error)?;

    // Claims are informational; a corrupt column degrades to none
    let claims: BTreeMap<String, String> = row
        .try_get::<String, _>("claims")
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(UserSession {
        user_id,
        provider,
        access_token: cipher.open(&access_token)?,
        refresh_token: refresh_token.map(|t| cipher.open(&t)).transpose()?,
        expires_at,
        claims,
    })
}

/// Serialize session claims for the `claims` column
pub fn claims_to_json(claims: &BTreeMap<String, String>) -> Result<String> {
    serde_json::to_string(claims)
        .map_err(|e| ExpenseError::Storage(format!("Failed to encode claims: {e}")))
}

/// Map sqlx errors onto the storage variant
pub fn sqlx_error_to_storage_error(err: sqlx::Error) -> ExpenseError {
    match &err {
        sqlx::Error::Database(db_err) => {
            ExpenseError::Storage(format!("Database constraint error: {}", db_err.message()))
        }
        sqlx::Error::RowNotFound => {
            // Absence is reported as Ok(None) by callers
            ExpenseError::Storage("Unexpected RowNotFound error".to_string())
        }
        sqlx::Error::ColumnNotFound(column) => {
            ExpenseError::Storage(format!("Missing column in user_sessions: {column}"))
        }
        sqlx::Error::PoolTimedOut => ExpenseError::Storage("Connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => ExpenseError::Storage(format!("Database I/O error: {io_err}")),
        _ => ExpenseError::Storage(format!("Database operation failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_json_roundtrip_shape() {
        let mut claims = BTreeMap::new();
        claims.insert("email".to_string(), "a@example.test".to_string());
        assert_eq!(claims_to_json(&claims).unwrap(), r#"{"email":"a@example.test"}"#);
        assert_eq!(claims_to_json(&BTreeMap::new()).unwrap(), "{}");
    }

    #[test]
    fn test_error_mapping_is_storage() {
        assert!(matches!(
            sqlx_error_to_storage_error(sqlx::Error::PoolTimedOut),
            ExpenseError::Storage(_)
        ));
        assert!(matches!(
            sqlx_error_to_storage_error(sqlx::Error::RowNotFound),
            ExpenseError::Storage(_)
        ));
    }
}
