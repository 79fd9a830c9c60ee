//! Mock implementation of SessionRepository trait
//!
//! Provides a thread-safe in-memory session store with:
//! - Error injection capabilities
//! - Call tracking for verification

use async_trait::async_trait;
use expense_core::{ExpenseError, Result, SessionRepository, UserSession};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock implementation of SessionRepository for testing
#[derive(Clone, Default)]
pub struct MockSessionRepository {
    sessions: Arc<Mutex<HashMap<String, UserSession>>>,
    error_injection: Arc<Mutex<Option<ExpenseError>>>,
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockSessionRepository {
    /// Create a new empty mock repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Create mock repository with pre-populated sessions
    pub fn with_sessions(sessions: Vec<UserSession>) -> Self {
        let repo = Self::new();
        {
            let mut stored = repo.sessions.lock();
            for session in sessions {
                stored.insert(session.user_id.clone(), session);
            }
        }
        repo
    }

    /// Inject error for next operation
    pub fn inject_error(&self, error: ExpenseError) {
        *self.error_injection.lock() = Some(error);
    }

    /// Clear error injection
    pub fn clear_error(&self) {
        *self.error_injection.lock() = None;
    }

    /// Get history of called methods
    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }

    /// Snapshot of a stored session, bypassing call tracking
    pub fn stored(&self, user_id: &str) -> Option<UserSession> {
        self.sessions.lock().get(user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Assert method was called
    pub fn assert_called(&self, method: &str) {
        let history = self.call_history.lock();
        assert!(
            history.iter().any(|call| call.contains(method)),
            "Method '{}' was not called. Call history: {:?}",
            method,
            *history
        );
    }

    /// Check if an error should be injected, consuming it if so
    fn check_error_injection(&self) -> Result<()> {
        if let Some(error) = self.error_injection.lock().take() {
            return Err(error);
        }
        Ok(())
    }

    fn record_call(&self, method: &str, params: &str) {
        self.call_history.lock().push(format!("{method}({params})"));
    }
}

#[async_trait]
impl SessionRepository for MockSessionRepository {
    async fn load_all(&self) -> Result<Vec<UserSession>> {
        self.record_call("load_all", "");
        self.check_error_injection()?;
        let mut sessions: Vec<UserSession> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(sessions)
    }

    async fn load(&self, user_id: &str) -> Result<Option<UserSession>> {
        self.record_call("load", &format!("user_id={user_id}"));
        self.check_error_injection()?;
        Ok(self.sessions.lock().get(user_id).cloned())
    }

    async fn save(&self, session: &UserSession) -> Result<()> {
        self.record_call("save", &format!("user_id={}", session.user_id));
        self.check_error_injection()?;
        self.sessions
            .lock()
            .insert(session.user_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        self.record_call("delete", &format!("user_id={user_id}"));
        self.check_error_injection()?;
        Ok(self.sessions.lock().remove(user_id).is_some())
    }

    async fn health_check(&self) -> Result<()> {
        self.record_call("health_check", "");
        self.check_error_injection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::create_valid_session;

    #[tokio::test]
    async fn test_error_injection_is_consumed() {
        let repo = MockSessionRepository::new();
        repo.inject_error(ExpenseError::Storage("disk full".into()));

        let session = create_valid_session("google:a");
        assert!(repo.save(&session).await.is_err());
        assert!(repo.save(&session).await.is_ok());
        assert_eq!(repo.len(), 1);
        repo.assert_called("save");
    }
}
