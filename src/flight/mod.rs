//! Deduplication of identical in-flight work.
//!
//! Two cooperating mechanisms, both keyed by the request's
//! [`flight_key`](crate::Request::flight_key):
//!
//! - [`LockManager`] — single-flight: concurrent identical submissions share
//!   one execution and one outcome.
//! - [`DebounceManager`] — trailing-edge debounce: bursts of identical
//!   submissions collapse into one execution after the burst goes quiet.

pub mod debounce;
pub mod lock;

pub use debounce::DebounceManager;
pub use lock::{LockManager, SharedOutcome};
