//! Middleware pipeline — composable layers wrapped around the transport call.
//!
//! This module defines the core types for building an ordered, onion-style
//! middleware chain. Each layer wraps the next, observing the request on the
//! way in and the outcome on the way out, and may short-circuit (serve from
//! cache), repeat its continuation (retry), or transform errors
//! (classification) without coupling callers to infrastructure concerns.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware; carries a name
//!   and a numeric priority (lower executes earlier, i.e. further out).
//! - [`Next`] — cursor into the remaining chain; call [`Next::run`] to
//!   advance. Cloneable so a layer can re-run its continuation.
//! - [`Exchange`] — per-execution context shared down the chain.
//! - [`MiddlewareEngine`] — named registration, priority ordering, per-request
//!   skips, and the terminal transport stage.
//!
//! Built-in layers, outermost first: [`timing`], [`cache`], [`retry`],
//! [`classify`].

pub mod cache;
pub mod classify;
pub mod retry;
pub mod timing;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::sync::{rw_read, rw_write};
use crate::transport::{Transport, TransportError};

const COMPONENT: &str = "middleware";

/// Name of the built-in instrumentation middleware.
pub const TIMING: &str = "timing";
/// Name of the built-in cache-check middleware.
pub const CACHE: &str = "cache";
/// Name of the built-in retry middleware.
pub const RETRY: &str = "retry";
/// Name of the built-in error-classification middleware.
pub const CLASSIFY: &str = "classify";

pub(crate) const TIMING_PRIORITY: i32 = 0;
pub(crate) const CACHE_PRIORITY: i32 = 10;
pub(crate) const RETRY_PRIORITY: i32 = 20;
pub(crate) const CLASSIFY_PRIORITY: i32 = 30;

/// Per-execution context threaded through the chain.
///
/// The request and cancellation token are fixed at creation; the mutable
/// bookkeeping (retry count, cache-hit flag) uses atomics because layers
/// hold the exchange behind `Arc`.
#[derive(Debug)]
pub struct Exchange {
    request: Arc<Request>,
    cancel: CancelToken,
    started_at: Instant,
    retry_count: AtomicU32,
    from_cache: AtomicBool,
}

impl Exchange {
    /// Creates a context for one engine execution.
    pub fn new(request: Arc<Request>, cancel: CancelToken) -> Self {
        return Self {
            request,
            cancel,
            started_at: Instant::now(),
            retry_count: AtomicU32::new(0),
            from_cache: AtomicBool::new(false),
        };
    }

    /// The request being executed.
    pub fn request(&self) -> &Arc<Request> {
        &self.request
    }

    /// The cancellation token for this execution.
    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// When the engine began executing this request.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// How many retries have run so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Records one retry.
    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the outcome was served from cache.
    pub fn from_cache(&self) -> bool {
        self.from_cache.load(Ordering::Relaxed)
    }

    /// Marks the outcome as served from cache.
    pub fn mark_cache_hit(&self) {
        self.from_cache.store(true, Ordering::Relaxed);
    }
}

/// A type-erased, heap-allocated middleware future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// The core trait for all turnstile middleware.
///
/// Implementors receive the [`Exchange`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — call `next.run(exchange).await` unchanged.
/// - **Short-circuit** — return an outcome without calling `next`.
/// - **Repeat** — clone `next` and run it more than once (the retry layer).
/// - **Transform** — call `next`, then rewrite the result or error.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one instance serves every
///   in-flight request.
/// - `handle` **must** return a pinned, `Send` future so the chain can be
///   awaited on multi-threaded runtimes.
/// - Errors returned without calling `next` abort the inner layers; errors
///   from `next` propagate outward through each enclosing layer in turn.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use turnstile::middleware::{Exchange, HandlerFuture, Middleware, Next};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn name(&self) -> &str {
///         "pass-through"
///     }
///
///     fn priority(&self) -> i32 {
///         50
///     }
///
///     fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture {
///         Box::pin(async move { next.run(exchange).await })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Unique name used for replacement, removal, and per-request skips.
    fn name(&self) -> &str;

    /// Chain position: lower numbers execute earlier (further out).
    fn priority(&self) -> i32;

    /// Handle the exchange and optionally delegate to the rest of the chain.
    fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture;
}

/// A cursor into the remaining middleware chain for a single execution.
///
/// `Next` is consumed by [`run`](Self::run), advancing one position and
/// invoking the next layer; when the chain is exhausted it invokes the
/// transport, wrapped in the request's timeout when one is set. Cloning the
/// cursor lets a layer run its continuation more than once.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    transport: Arc<dyn Transport>,
    // Tracks which layer to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Invokes the next layer (or the transport) and returns its outcome.
    pub async fn run(mut self, exchange: Arc<Exchange>) -> Result<Response> {
        if self.index < self.chain.len() {
            let handler = self.chain[self.index].clone();
            self.index += 1;
            handler.handle(exchange, self).await
        } else {
            terminal(self.transport, exchange).await
        }
    }
}

// The innermost stage: one transport call, bounded by the request timeout.
async fn terminal(transport: Arc<dyn Transport>, exchange: Arc<Exchange>) -> Result<Response> {
    let request = exchange.request().clone();
    let cancel = exchange.cancel().clone();
    let outcome = match request.timeout {
        Some(limit) => match tokio::time::timeout(limit, transport.execute(request, cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout(limit)),
        },
        None => transport.execute(request, cancel).await,
    };
    outcome.map_err(Error::from)
}

struct Registered {
    middleware: Arc<dyn Middleware>,
    // Arrival order, kept across in-place replacement for stable ties.
    seq: u64,
}

struct HandlerList {
    items: Vec<Registered>,
    next_seq: u64,
}

/// Ordered registry of middleware plus the terminal transport.
///
/// Executions snapshot the chain, so registration changes never affect
/// requests already in flight.
pub struct MiddlewareEngine {
    handlers: RwLock<HandlerList>,
    transport: Arc<dyn Transport>,
}

impl MiddlewareEngine {
    /// Creates an engine with an empty chain around `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            handlers: RwLock::new(HandlerList {
                items: Vec::new(),
                next_seq: 0,
            }),
            transport,
        }
    }

    /// Registers a middleware.
    ///
    /// If one with the same name exists it is replaced in place, keeping its
    /// arrival order for priority ties. The chain stays sorted by ascending
    /// priority.
    pub fn register(&self, middleware: Arc<dyn Middleware>) {
        let mut handlers = rw_write(&self.handlers, COMPONENT, "register");
        let name = middleware.name().to_owned();
        match handlers
            .items
            .iter_mut()
            .find(|registered| registered.middleware.name() == name)
        {
            Some(slot) => {
                slot.middleware = middleware;
                debug!(name, "middleware replaced");
            }
            None => {
                let seq = handlers.next_seq;
                handlers.next_seq += 1;
                handlers.items.push(Registered { middleware, seq });
                debug!(name, "middleware registered");
            }
        }
        handlers
            .items
            .sort_by_key(|registered| (registered.middleware.priority(), registered.seq));
    }

    /// Deregisters a middleware by name. Returns `true` if it existed.
    pub fn remove(&self, name: &str) -> bool {
        let mut handlers = rw_write(&self.handlers, COMPONENT, "remove");
        let before = handlers.items.len();
        handlers
            .items
            .retain(|registered| registered.middleware.name() != name);
        handlers.items.len() < before
    }

    /// Runs the chain for one exchange.
    ///
    /// Layers named in the request's `skip_middleware` set are excluded from
    /// this execution only.
    pub async fn execute(&self, exchange: Arc<Exchange>) -> Result<Response> {
        let chain: Vec<Arc<dyn Middleware>> = {
            let handlers = rw_read(&self.handlers, COMPONENT, "execute");
            handlers
                .items
                .iter()
                .filter(|registered| {
                    !exchange
                        .request()
                        .skip_middleware
                        .contains(registered.middleware.name())
                })
                .map(|registered| registered.middleware.clone())
                .collect()
        };
        let next = Next {
            chain: chain.into(),
            transport: self.transport.clone(),
            index: 0,
        };
        next.run(exchange).await
    }
}
