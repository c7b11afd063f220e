//! Trailing-edge debouncing of bursty identical requests.
//!
//! Every submission for a key restarts that key's window. Only when the
//! window elapses with no newer submission does the executor run — exactly
//! once, with the latest descriptor — and the one outcome is fanned out to
//! every caller collapsed into the burst.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::queue::Executor;
use crate::sync::mutex_lock;

const COMPONENT: &str = "flight.debounce";

struct Waiter {
    request_id: String,
    tx: oneshot::Sender<Result<Response>>,
}

struct DebounceEntry {
    waiters: Vec<Waiter>,
    timer: JoinHandle<()>,
    // Bumped on every restart; a firing timer with a stale generation
    // backs off instead of executing.
    generation: u64,
}

struct Registry {
    entries: HashMap<String, DebounceEntry>,
    next_generation: u64,
}

/// Per-key trailing-edge debounce.
///
/// Cloning is cheap and shares the registry.
#[derive(Clone)]
pub struct DebounceManager {
    registry: Arc<Mutex<Registry>>,
    window: Duration,
}

impl DebounceManager {
    /// Creates a manager whose keys debounce over `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                entries: HashMap::new(),
                next_generation: 0,
            })),
            window,
        }
    }

    /// Joins the burst for `key`, restarting its window.
    ///
    /// Resolves with the trailing execution's outcome once a window finally
    /// elapses undisturbed, or with [`Error::Cancelled`] if this caller is
    /// cancelled out of the burst first.
    pub async fn submit(
        &self,
        key: String,
        request: Arc<Request>,
        cancel: CancelToken,
        executor: Executor,
    ) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = mutex_lock(&self.registry, COMPONENT, "submit");
            let generation = registry.next_generation;
            registry.next_generation += 1;
            let waiter = Waiter {
                request_id: request.request_id.clone(),
                tx,
            };
            // The timer always runs the latest descriptor of the burst.
            let timer = self.spawn_window(key.clone(), generation, request, cancel, executor);
            match registry.entries.get_mut(&key) {
                Some(entry) => {
                    entry.timer.abort();
                    entry.timer = timer;
                    entry.generation = generation;
                    entry.waiters.push(waiter);
                    debug!(key = %key, waiters = entry.waiters.len(), "debounce window restarted");
                }
                None => {
                    registry.entries.insert(
                        key.clone(),
                        DebounceEntry {
                            waiters: vec![waiter],
                            timer,
                            generation,
                        },
                    );
                    debug!(key = %key, "debounce window opened");
                }
            }
        }
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    fn spawn_window(
        &self,
        key: String,
        generation: u64,
        request: Arc<Request>,
        cancel: CancelToken,
        executor: Executor,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let waiters = {
                let mut registry = mutex_lock(&manager.registry, COMPONENT, "fire");
                let current = registry
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation);
                if !current {
                    // A newer submission restarted the window.
                    return;
                }
                registry
                    .entries
                    .remove(&key)
                    .map(|entry| entry.waiters)
                    .unwrap_or_default()
            };
            if waiters.is_empty() {
                return;
            }
            debug!(key = %key, waiters = waiters.len(), "debounce window elapsed");
            let result = executor(request, cancel).await;
            for waiter in waiters {
                let _ = waiter.tx.send(result.clone());
            }
        })
    }

    /// Cancels one caller out of its burst.
    ///
    /// The matching waiter settles as [`Error::Cancelled`]; the window (and
    /// its eventual execution) survives unless this was the last waiter.
    /// Returns `true` if anything matched.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let mut settled = Vec::new();
        {
            let mut registry = mutex_lock(&self.registry, COMPONENT, "cancel_request");
            let mut emptied = Vec::new();
            for (key, entry) in registry.entries.iter_mut() {
                let (matching, rest): (Vec<Waiter>, Vec<Waiter>) =
                    std::mem::take(&mut entry.waiters)
                        .into_iter()
                        .partition(|waiter| waiter.request_id == request_id);
                entry.waiters = rest;
                settled.extend(matching.into_iter().map(|waiter| waiter.tx));
                if entry.waiters.is_empty() {
                    entry.timer.abort();
                    emptied.push(key.clone());
                }
            }
            for key in emptied {
                registry.entries.remove(&key);
                debug!(key = %key, "debounce window dropped, no waiters left");
            }
        }
        let matched = !settled.is_empty();
        for tx in settled {
            let _ = tx.send(Err(Error::Cancelled));
        }
        matched
    }

    /// Cancels every pending window and settles every waiter as cancelled.
    pub fn cancel_all(&self) {
        let mut settled = Vec::new();
        {
            let mut registry = mutex_lock(&self.registry, COMPONENT, "cancel_all");
            for (_, entry) in registry.entries.drain() {
                entry.timer.abort();
                settled.extend(entry.waiters.into_iter().map(|waiter| waiter.tx));
            }
        }
        debug!(count = settled.len(), "debounce windows cancelled");
        for tx in settled {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    /// Number of keys with an open window.
    pub fn pending_count(&self) -> usize {
        mutex_lock(&self.registry, COMPONENT, "pending_count")
            .entries
            .len()
    }
}
