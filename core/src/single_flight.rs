use crate::error::{ExpenseError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T>>>;

struct Flight<T: Clone> {
    id: u64,
    outcome: SharedOutcome<T>,
    finished: Arc<AtomicBool>,
}

/// Collapses concurrent executions of the same keyed operation into one.
///
/// The first caller for a key starts the operation on a detached tokio task;
/// every caller that arrives while it runs awaits the same shared outcome,
/// success or failure. Dropping a waiter never cancels the operation, so a
/// refresh that has started always completes and publishes its result.
///
/// Used by the token manager (single key) and the session store (keyed by
/// user id).
pub struct SingleFlight<K, T: Clone> {
    flights: Mutex<HashMap<K, Flight<T>>>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `start()` for `key` unless a run for the same key is already in
    /// flight, in which case join it.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (id, outcome) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                // A finished flight whose owner was cancelled before cleanup is stale
                Some(flight) if !flight.finished.load(Ordering::Acquire) => {
                    (flight.id, flight.outcome.clone())
                }
                _ => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let finished = Arc::new(AtomicBool::new(false));
                    let operation = start();
                    let done = finished.clone();
                    let handle = tokio::spawn(async move {
                        let result = operation.await;
                        done.store(true, Ordering::Release);
                        result
                    });
                    let outcome = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(ExpenseError::Internal(format!("refresh task aborted: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    flights.insert(
                        key.clone(),
                        Flight {
                            id,
                            outcome: outcome.clone(),
                            finished,
                        },
                    );
                    (id, outcome)
                }
            }
        };

        let result = outcome.await;

        let mut flights = self.flights.lock();
        if flights.get(&key).is_some_and(|flight| flight.id == id) {
            flights.remove(&key);
        }
        result
    }

    /// Number of keys with an operation currently registered
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}
