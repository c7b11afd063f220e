//! The error taxonomy for orchestrated requests.
//!
//! Every submission settles with exactly one [`Error`] variant (or a
//! response). The taxonomy is a closed enum dispatched by pattern match;
//! variants are `Clone` because single-flight and debounce fan one terminal
//! outcome out to every collapsed caller.

use thiserror::Error as ThisError;

use crate::http::Method;
use crate::transport::TransportError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal outcome of a failed submission.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// The transport failed: connection, timeout, or HTTP error status.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller-supplied validator flagged a logically-failed response.
    #[error("response validation failed: {reason}")]
    Validation {
        /// Why the validator rejected the response.
        reason: String,
    },

    /// The admission queue backlog was full at submission time.
    #[error("admission queue is full ({waiting} waiting, limit {limit})")]
    Capacity {
        /// Backlog size observed at rejection.
        waiting: usize,
        /// The configured `max_queue_size`.
        limit: usize,
    },

    /// The request was cancelled, explicitly or in bulk.
    #[error("request was cancelled")]
    Cancelled,

    /// An envelope adding request context to the underlying failure.
    ///
    /// Produced by the classification middleware; the original error is
    /// reachable through [`Error::root`].
    #[error("{method} {url} (request {request_id}) failed after {attempts} attempt(s): {source}")]
    Wrapped {
        /// HTTP method of the failed request.
        method: Method,
        /// Target URL of the failed request.
        url: String,
        /// The request id the failure belongs to.
        request_id: String,
        /// How many attempts had run when this error was produced.
        attempts: u32,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Unwraps [`Error::Wrapped`] envelopes down to the underlying error.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Wrapped { source, .. } = current {
            current = source;
        }
        current
    }

    /// Returns the HTTP status code carried by the underlying error, if any.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            Error::Transport(TransportError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if the underlying failure was a transport timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Transport(TransportError::Timeout(_)))
    }

    /// Returns `true` if the underlying failure was a connection failure.
    pub fn is_connect(&self) -> bool {
        matches!(self.root(), Error::Transport(TransportError::Connect(_)))
    }

    /// Returns `true` if this outcome is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    /// The default retry classification.
    ///
    /// Retryable: connection failures, timeouts, and HTTP status 408, 429,
    /// or any 5xx. Everything else (validation, capacity, cancellation,
    /// other 4xx) is terminal.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::Transport(TransportError::Connect(_)) => true,
            Error::Transport(TransportError::Timeout(_)) => true,
            Error::Transport(TransportError::Status { status, .. }) => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}
