use crate::{
    error::{ExpenseError, Result},
    models::PendingAuthorization,
};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub const DEFAULT_PENDING_TTL_SECS: i64 = 600;
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Time-boxed store of started logins, keyed by `state`.
///
/// Expired entries are purged lazily on every insert and rejected on take.
/// The store is also bounded so abandoned logins cannot grow it without
/// limit; at capacity the oldest entry is evicted.
pub struct PendingAuthorizations {
    entries: Mutex<HashMap<String, PendingAuthorization>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for PendingAuthorizations {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_PENDING_TTL_SECS), DEFAULT_MAX_PENDING)
    }
}

impl PendingAuthorizations {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn insert(&self, pending: PendingAuthorization) {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, p| !p.is_expired_at(now, self.ttl));

        while entries.len() >= self.max_entries {
            let oldest = entries
                .values()
                .min_by_key(|p| p.created_at)
                .map(|p| p.state.clone());
            match oldest {
                Some(state) => {
                    entries.remove(&state);
                    debug!("Evicted oldest pending login at capacity");
                }
                None => break,
            }
        }
        entries.insert(pending.state.clone(), pending);
    }

    /// Consume the pending login for `state`. Succeeds at most once per state.
    pub fn take(&self, state: &str) -> Result<PendingAuthorization> {
        let pending = self.entries.lock().remove(state).ok_or_else(|| {
            ExpenseError::AuthenticationFailed(
                "unknown or already used login state".to_string(),
            )
        })?;

        if pending.is_expired_at(Utc::now(), self.ttl) {
            return Err(ExpenseError::AuthenticationFailed(
                "login attempt expired".to_string(),
            ));
        }
        Ok(pending)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, p| !p.is_expired_at(now, self.ttl));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
