//! Cooperative cancellation handles.
//!
//! A [`CancelToken`] is created per submission and threaded through the
//! admission queue, the middleware chain, and the transport. Cancellation is
//! cooperative: the holder of a token observes it at its next suspension
//! point; the queue additionally races the token against the in-flight
//! execution so callers always settle.

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A cloneable cancellation flag shared by everyone involved in one request.
///
/// Clones observe the same underlying state: once any clone calls
/// [`cancel`](Self::cancel), [`is_cancelled`](Self::is_cancelled) reports
/// `true` everywhere and every pending [`cancelled`](Self::cancelled) future
/// completes.
///
/// # Examples
///
/// ```
/// use turnstile::CancelToken;
///
/// let token = CancelToken::new();
/// let observer = token.clone();
/// assert!(!observer.is_cancelled());
///
/// token.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Creates a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the token to cancelled and wakes every waiter.
    ///
    /// Idempotent — repeated calls have no further effect.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves when the token is cancelled.
    ///
    /// Completes immediately if cancellation already happened. Intended for
    /// `tokio::select!` races against in-flight work.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut notified = pin!(self.inner.notify.notified());
        loop {
            // Register interest before re-checking the flag so a concurrent
            // `cancel` between the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::task::yield_now().await;
        token.cancel();
        assert!(handle.await.expect("waiter task"));
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await; // must not hang
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
