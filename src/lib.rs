//! # turnstile
//!
//! Priority-scheduled, cache-aware orchestration of outbound HTTP requests.
//!
//! Turnstile sits in front of an opaque async transport and decides
//! *whether, when, and how many times* a call is actually made — and what
//! can be returned without making it. It composes:
//!
//! - an **admission queue** — priority-ordered, concurrency-capped,
//!   backlog-bounded;
//! - an **onion middleware chain** — instrumentation, cache-check, retry
//!   with backoff, and error classification, plus whatever you register;
//! - a **TTL + LRU response cache** with lifetime statistics;
//! - **single-flight locking** and **trailing-edge debouncing** of
//!   identical requests.
//!
//! The transport itself — sockets, TLS, pooling, platform adapters — is a
//! collaborator you supply.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use turnstile::{Orchestrator, Request, Response, transport_fn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), turnstile::Error> {
//!     let transport = transport_fn(|_request, _cancel| async {
//!         // Issue the real network call here.
//!         Ok(Response::new(200).body("{}"))
//!     });
//!     let orchestrator = Orchestrator::new(transport);
//!
//!     let response = orchestrator
//!         .submit(Request::get("https://api.example.com/users"))
//!         .await?;
//!     println!("status: {}", response.status);
//!     Ok(())
//! }
//! ```

// ── Public modules ────────────────────────────────────────────────────────────
pub mod cache;
pub mod cancel;
pub mod error;
pub mod flight;
pub mod http;
pub mod middleware;
pub mod orchestrator;
pub mod queue;
pub mod transport;

// ── Internal helpers ──────────────────────────────────────────────────────────
mod sync;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheConfigUpdate, CacheStats};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use http::{Backoff, CachePolicy, Headers, Method, Request, Response, RetryPolicy};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use queue::{QueueConfig, QueueConfigUpdate, QueueStats};
pub use transport::{Transport, TransportError, transport_fn};
