//! Single-flight request locking.
//!
//! At most one execution may be in flight per dedup key. The first caller's
//! work future is made [`Shared`]; everyone arriving before settlement gets
//! a clone and observes the identical outcome. The check-and-register step
//! is atomic under one mutex — the invariant this module exists for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::Shared;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::middleware::HandlerFuture;
use crate::sync::mutex_lock;

const COMPONENT: &str = "flight.lock";

/// A cloneable handle to an in-flight (or settled) outcome.
pub type SharedOutcome = Shared<HandlerFuture>;

struct PendingLock {
    outcome: SharedOutcome,
    cancel: CancelToken,
    request_id: String,
    generation: u64,
    created_at: Instant,
}

struct Registry {
    pending: HashMap<String, PendingLock>,
    next_generation: u64,
}

/// The in-flight registry for single-flight deduplication.
///
/// Cloning is cheap and shares the registry.
#[derive(Clone)]
pub struct LockManager {
    registry: Arc<Mutex<Registry>>,
}

// Removes the registry entry the moment the shared execution settles — or
// is abandoned before settling. Generation-checked so a late release can
// never evict a successor flight under the same key.
struct ReleaseGuard {
    manager: LockManager,
    key: String,
    generation: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let mut registry = mutex_lock(&self.manager.registry, COMPONENT, "release");
        let same_flight = registry
            .pending
            .get(&self.key)
            .is_some_and(|pending| pending.generation == self.generation);
        if same_flight {
            registry.pending.remove(&self.key);
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                pending: HashMap::new(),
                next_generation: 0,
            })),
        }
    }

    /// Returns the in-flight outcome for `key`, if one exists.
    pub fn check_duplicate(&self, key: &str) -> Option<SharedOutcome> {
        let registry = mutex_lock(&self.registry, COMPONENT, "check_duplicate");
        registry
            .pending
            .get(key)
            .map(|pending| pending.outcome.clone())
    }

    /// Joins the in-flight execution for `key`, or starts one.
    ///
    /// The lookup and the insertion happen under one lock, so two concurrent
    /// callers can never both invoke `factory`. The factory is called
    /// exactly once per flight and its future is shared; the registry entry
    /// is removed the instant the flight settles, however many callers are
    /// still waiting on clones of it.
    pub fn register<F>(
        &self,
        key: &str,
        request_id: &str,
        cancel: CancelToken,
        factory: F,
    ) -> SharedOutcome
    where
        F: FnOnce() -> HandlerFuture,
    {
        let mut registry = mutex_lock(&self.registry, COMPONENT, "register");
        if let Some(pending) = registry.pending.get(key) {
            debug!(key, leader = %pending.request_id, "joining in-flight request");
            return pending.outcome.clone();
        }

        let generation = registry.next_generation;
        registry.next_generation += 1;
        let release = ReleaseGuard {
            manager: self.clone(),
            key: key.to_owned(),
            generation,
        };
        let execution = factory();
        let outcome: SharedOutcome = async move {
            let _release = release;
            execution.await
        }
        .boxed()
        .shared();

        registry.pending.insert(
            key.to_owned(),
            PendingLock {
                outcome: outcome.clone(),
                cancel,
                request_id: request_id.to_owned(),
                generation,
                created_at: Instant::now(),
            },
        );
        debug!(key, leader = %request_id, "request lock registered");
        outcome
    }

    /// Cancels flights whose *leader* carries `request_id`.
    ///
    /// The flight's token is cancelled and the entry removed, so the next
    /// submission under the key starts fresh. Every caller sharing the
    /// flight observes the cancelled outcome. Returns `true` if anything
    /// matched.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let mut registry = mutex_lock(&self.registry, COMPONENT, "cancel_request");
        let keys: Vec<String> = registry
            .pending
            .iter()
            .filter(|(_, pending)| pending.request_id == request_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(pending) = registry.pending.remove(key) {
                pending.cancel.cancel();
                debug!(key = %key, age = ?pending.created_at.elapsed(), "in-flight request cancelled");
            }
        }
        !keys.is_empty()
    }

    /// Cancels every registered flight.
    pub fn cancel_all(&self) {
        let mut registry = mutex_lock(&self.registry, COMPONENT, "cancel_all");
        for (_, pending) in registry.pending.drain() {
            pending.cancel.cancel();
        }
    }

    /// Number of flights currently registered.
    pub fn pending_count(&self) -> usize {
        mutex_lock(&self.registry, COMPONENT, "pending_count")
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::http::Response;
    use crate::transport::TransportError;

    fn slow_success(calls: Arc<AtomicU32>) -> HandlerFuture {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Response::new(200).body("shared"))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let manager = LockManager::new();
        let calls = Arc::new(AtomicU32::new(0));

        let first = manager.register("users", "req-1", CancelToken::new(), {
            let calls = calls.clone();
            move || slow_success(calls)
        });
        // The flight is registered, so the second factory must not run.
        let second = manager.register("users", "req-2", CancelToken::new(), || {
            Box::pin(async { panic!("second factory must never be invoked") })
        });

        let (a, b) = tokio::join!(first, second);
        let a = a.expect("first caller outcome");
        let b = b.expect("second caller outcome");
        assert_eq!(a.data, b.data);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settled_flights_are_released() {
        let manager = LockManager::new();
        let calls = Arc::new(AtomicU32::new(0));

        let flight = manager.register("users", "req-1", CancelToken::new(), {
            let calls = calls.clone();
            move || slow_success(calls)
        });
        assert!(manager.check_duplicate("users").is_some());
        flight.await.expect("flight outcome");
        assert!(manager.check_duplicate("users").is_none());

        // A fresh submission starts a fresh execution.
        let flight = manager.register("users", "req-3", CancelToken::new(), {
            let calls = calls.clone();
            move || slow_success(calls)
        });
        flight.await.expect("second flight outcome");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_fan_out_unchanged() {
        let manager = LockManager::new();

        let first = manager.register("users", "req-1", CancelToken::new(), || {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(Error::from(TransportError::Connect("refused".into())))
            })
        });
        let second = manager.register("users", "req-2", CancelToken::new(), || {
            Box::pin(async { panic!("second factory must never be invoked") })
        });

        let (a, b) = tokio::join!(first, second);
        assert!(a.expect_err("first sees failure").is_connect());
        assert!(b.expect_err("second sees the same failure").is_connect());
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn leader_cancellation_clears_the_key() {
        let manager = LockManager::new();
        let token = CancelToken::new();

        let _flight = manager.register("users", "req-1", token.clone(), || {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Response::new(200))
            })
        });

        assert!(manager.cancel_request("req-1"));
        assert!(token.is_cancelled());
        assert_eq!(manager.pending_count(), 0);
        assert!(!manager.cancel_request("req-1"));
    }
}
