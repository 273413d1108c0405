//! Coalesces concurrent loads of the same key into a single execution.
//!
//! The first caller for a key becomes the leader and runs the actual work; everybody
//! else subscribes to the leader's completion broadcast and receives the very same
//! outcome. On top of the in-flight deduplication, a short lived memo remembers the
//! outcome (value *or* error) for a few seconds. The memo is what keeps a failing
//! origin from being hammered by retry storms: every caller within the memo window is
//! answered from memory, successful or not.
#[cfg(test)]
use mock_instant::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::CacheError;
use crate::value::Value;

/// Floor applied to the memo lifetime when an overly small value is configured.
pub const MIN_MEMO_TTL: Duration = Duration::from_secs(3);

/// The shared result of a coalesced load.
pub type Outcome = Result<Value, CacheError>;

/// An in-flight load. Waiters subscribe to the completion broadcast.
struct Call {
    tx: broadcast::Sender<Outcome>,
}

/// A memoized outcome with its expiry instant.
struct MemoEntry {
    outcome: Outcome,
    expires_at: Instant,
}

#[derive(Default)]
struct FlightState {
    calls: HashMap<String, Call>,
    memo: HashMap<String, MemoEntry>,
}

/// Deduplicates concurrent loads per key and memoizes their outcomes.
///
/// The lock protecting the internal maps is never held while the work future runs;
/// waiters suspend on a broadcast channel, not on the lock.
pub struct SingleFlight {
    state: Arc<RwLock<FlightState>>,
    memo_ttl: Duration,
}

impl SingleFlight {
    /// Creates a new instance memoizing outcomes for the given lifetime.
    ///
    /// Lifetimes below [MIN_MEMO_TTL] (including zero) are raised to that floor.
    pub fn new(memo_ttl: Duration) -> Self {
        SingleFlight {
            state: Arc::new(RwLock::new(FlightState::default())),
            memo_ttl: memo_ttl.max(MIN_MEMO_TTL),
        }
    }

    /// Runs `work` for the given key, unless a memoized outcome or an in-flight call
    /// already answers it.
    ///
    /// Guarantees that between the start of the first call and the completion of the
    /// last one, `work` executes at most once per key. All callers observe the outcome
    /// the leader produced.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome>,
    {
        if let Some(outcome) = self.memo_lookup(key) {
            return outcome;
        }

        // Double-checked registration: most waiters discover the in-flight call under
        // the cheap read lock; only the race for leadership takes the write lock.
        let mut rx = {
            let state = self.state.read().unwrap();
            state.calls.get(key).map(|call| call.tx.subscribe())
        };

        if rx.is_none() {
            let mut state = self.state.write().unwrap();
            if let Some(call) = state.calls.get(key) {
                rx = Some(call.tx.subscribe());
            } else {
                let (tx, _) = broadcast::channel(1);
                let _ = state.calls.insert(key.to_owned(), Call { tx });
            }
        }

        if let Some(mut rx) = rx {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                // The leader vanished without publishing a result, which only happens
                // while the process tears down.
                Err(_) => Err(CacheError::ShuttingDown),
            };
        }

        // We are the leader: run the work with no lock held, memoize the outcome,
        // retire the call and wake all waiters.
        let outcome = work().await;

        let tx = {
            let mut state = self.state.write().unwrap();
            let _ = state.memo.insert(
                key.to_owned(),
                MemoEntry {
                    outcome: outcome.clone(),
                    expires_at: Instant::now() + self.memo_ttl,
                },
            );
            state.calls.remove(key).map(|call| call.tx)
        };
        if let Some(tx) = tx {
            let _ = tx.send(outcome.clone());
        }

        outcome
    }

    /// Returns the memoized outcome for the key if it is still fresh.
    ///
    /// A stale entry is removed asynchronously; the removal re-checks the expiry under
    /// the write lock so that it cannot race a fresh insert for the same key.
    fn memo_lookup(&self, key: &str) -> Option<Outcome> {
        {
            let state = self.state.read().unwrap();
            let entry = state.memo.get(key)?;
            if Instant::now() <= entry.expires_at {
                return Some(entry.outcome.clone());
            }
        }

        let shared = self.state.clone();
        let key = key.to_owned();
        crate::spawn!(async move {
            let mut state = shared.write().unwrap();
            if let Some(entry) = state.memo.get(&key) {
                if entry.expires_at < Instant::now() {
                    let _ = state.memo.remove(&key);
                }
            }
        });

        None
    }

    /// Returns the number of memoized outcomes, fresh or stale.
    pub fn memo_len(&self) -> usize {
        self.state.read().unwrap().memo.len()
    }
}
