//! The composition root and public control surface.
//!
//! An [`Orchestrator`] wires the layers together:
//!
//! ```text
//! submit → debounce? → request lock? → admission queue → middleware chain → transport
//! ```
//!
//! and exposes the runtime controls — cancellation, middleware
//! registration, cache and queue statistics, and live config updates.
//! Instances are explicitly constructed and owned by the caller; there is
//! no process-wide default.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CacheConfig, CacheConfigUpdate, CacheManager, CacheStats};
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::flight::{DebounceManager, LockManager};
use crate::http::{Request, Response};
use crate::middleware::cache::CacheMiddleware;
use crate::middleware::classify::ClassifyMiddleware;
use crate::middleware::retry::RetryMiddleware;
use crate::middleware::timing::TimingMiddleware;
use crate::middleware::{Exchange, HandlerFuture, Middleware, MiddlewareEngine};
use crate::queue::{AdmissionQueue, Executor, QueueConfig, QueueConfigUpdate, QueueStats};
use crate::transport::Transport;

/// Construction-time settings for an orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Admission queue limits.
    pub queue: QueueConfig,
    /// Response cache capacity and default TTL.
    pub cache: CacheConfig,
    /// The trailing-edge window for debounced requests.
    pub debounce_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            debounce_window: Duration::from_millis(300),
        }
    }
}

/// The request orchestration front door.
///
/// # Examples
///
/// ```rust,no_run
/// use turnstile::{Orchestrator, Request, Response, transport_fn};
///
/// #[tokio::main]
/// async fn main() -> Result<(), turnstile::Error> {
///     let transport = transport_fn(|_request, _cancel| async {
///         // Issue the real network call here.
///         Ok(Response::new(200).body("{}"))
///     });
///     let orchestrator = Orchestrator::new(transport);
///
///     let response = orchestrator
///         .submit(Request::get("https://api.example.com/users"))
///         .await?;
///     println!("status: {}", response.status);
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    engine: Arc<MiddlewareEngine>,
    queue: AdmissionQueue,
    locks: LockManager,
    debounce: DebounceManager,
    cache: Arc<CacheManager>,
    // The lock-aware path into the queue; also handed to debounce timers.
    dispatch: Executor,
}

impl Orchestrator {
    /// Creates an orchestrator with default limits around `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, OrchestratorConfig::default())
    }

    /// Creates an orchestrator with explicit limits around `transport`.
    pub fn with_config(transport: Arc<dyn Transport>, config: OrchestratorConfig) -> Self {
        let cache = Arc::new(CacheManager::new(config.cache));
        let engine = Arc::new(MiddlewareEngine::new(transport));
        engine.register(Arc::new(TimingMiddleware));
        engine.register(Arc::new(CacheMiddleware::new(cache.clone())));
        engine.register(Arc::new(RetryMiddleware));
        engine.register(Arc::new(ClassifyMiddleware));

        let executor: Executor = {
            let engine = engine.clone();
            Arc::new(move |request, cancel| {
                let engine = engine.clone();
                Box::pin(async move {
                    let exchange = Arc::new(Exchange::new(request, cancel));
                    engine.execute(exchange).await
                })
            })
        };
        let queue = AdmissionQueue::new(config.queue, executor);
        let locks = LockManager::new();

        let dispatch: Executor = {
            let queue = queue.clone();
            let locks = locks.clone();
            Arc::new(move |request, cancel| {
                let queue = queue.clone();
                let locks = locks.clone();
                Box::pin(async move {
                    if request.request_lock {
                        let key = request.flight_key();
                        let flight = locks.register(&key, &request.request_id, cancel.clone(), {
                            let queue = queue.clone();
                            let request = request.clone();
                            move || {
                                Box::pin(async move { queue.submit(request, cancel).await })
                                    as HandlerFuture
                            }
                        });
                        flight.await
                    } else {
                        queue.submit(request, cancel).await
                    }
                })
            })
        };

        return Self {
            engine,
            queue,
            locks,
            debounce: DebounceManager::new(config.debounce_window),
            cache,
            dispatch,
        };
    }

    /// Submits a request and awaits its terminal outcome.
    ///
    /// The descriptor decides the path: debounced requests join their key's
    /// burst; locked requests share any in-flight execution under their
    /// dedup key; everything else goes straight to admission.
    pub async fn submit(&self, request: Request) -> Result<Response> {
        let request = Arc::new(request);
        let cancel = CancelToken::new();
        debug!(
            id = %request.request_id,
            method = %request.method,
            url = %request.url,
            priority = request.priority,
            "request submitted"
        );
        if request.debounce {
            let key = request.flight_key();
            self.debounce
                .submit(key, request, cancel, self.dispatch.clone())
                .await
        } else {
            (self.dispatch)(request, cancel).await
        }
    }

    /// Cancels everything belonging to `request_id`, wherever it is —
    /// waiting, running, in a debounce burst, or leading a shared flight.
    ///
    /// Returns `true` if anything matched.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut matched = self.queue.cancel_request(request_id);
        matched |= self.locks.cancel_request(request_id);
        matched |= self.debounce.cancel_request(request_id);
        matched
    }

    /// Cancels every outstanding request.
    pub fn cancel_all(&self) {
        self.debounce.cancel_all();
        self.locks.cancel_all();
        self.queue.cancel_all();
    }

    /// Registers (or replaces) a middleware in the execution chain.
    pub fn register_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.engine.register(middleware);
    }

    /// Removes a middleware by name. Returns `true` if it existed.
    pub fn remove_middleware(&self, name: &str) -> bool {
        self.engine.remove(name)
    }

    /// Current cache occupancy and lifetime hit/miss statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Clears the response cache.
    ///
    /// With a pattern, only keys containing it are removed; returns how
    /// many entries were dropped.
    pub fn clear_cache(&self, pattern: Option<&str>) -> usize {
        match pattern {
            Some(pattern) => self.cache.clear_matching(pattern),
            None => {
                let size = self.cache.stats().size;
                self.cache.clear();
                size
            }
        }
    }

    /// Applies a cache capacity and/or TTL update.
    pub fn update_cache_config(&self, update: CacheConfigUpdate) {
        self.cache.update_config(update);
    }

    /// Current queue occupancy and limits.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Applies new queue limits, immediately admitting newly-eligible tasks.
    pub fn update_queue_config(&self, update: QueueConfigUpdate) {
        self.queue.update_config(update);
    }
}
