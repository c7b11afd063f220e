//! The transport seam — the one async call the orchestrator never makes twice
//! without deciding to.
//!
//! A [`Transport`] issues a single request on the wire and resolves with a
//! [`Response`] or a [`TransportError`]. Everything above it (queueing,
//! caching, deduplication, retry) lives in this crate; everything below it
//! (sockets, TLS, connection pooling, platform adapters) is the
//! implementor's business. Implementations must honor the [`CancelToken`]
//! they are handed — the orchestrator requests aborts through it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::http::{Request, Response};

/// Failures originating at or below the transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection could not be established or broke mid-flight.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No response arrived within the allotted time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-success HTTP status.
    #[error("HTTP status {status}")]
    Status {
        /// The response status code.
        status: u16,
        /// The response body, kept for diagnostics.
        body: Bytes,
    },

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// An opaque asynchronous executor for a single outbound request.
///
/// The orchestrator treats implementations as black boxes: it never inspects
/// how bytes reach the wire, only the [`Response`] / [`TransportError`]
/// outcome. Implementations should observe `cancel` at their suspension
/// points and bail out with whatever partial-failure error fits.
///
/// For tests and small programs, [`transport_fn`] adapts an async closure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues the request on the wire.
    async fn execute(
        &self,
        request: Arc<Request>,
        cancel: CancelToken,
    ) -> Result<Response, TransportError>;
}

// Type-erased adapter so plain async closures can act as transports.
struct FnTransport<F>(F);

#[async_trait]
impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(Arc<Request>, CancelToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, TransportError>> + Send,
{
    async fn execute(
        &self,
        request: Arc<Request>,
        cancel: CancelToken,
    ) -> Result<Response, TransportError> {
        (self.0)(request, cancel).await
    }
}

/// Wraps an async closure into an `Arc<dyn Transport>`.
///
/// # Examples
///
/// ```
/// use turnstile::{Response, transport_fn};
///
/// let transport = transport_fn(|_request, _cancel| async {
///     Ok(Response::new(200).body("{\"ok\":true}"))
/// });
/// # let _ = transport;
/// ```
pub fn transport_fn<F, Fut>(f: F) -> Arc<dyn Transport>
where
    F: Fn(Arc<Request>, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportError>> + Send + 'static,
{
    Arc::new(FnTransport(f))
}
