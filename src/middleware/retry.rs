//! Built-in retry middleware.
//!
//! Wraps its continuation in a bounded, strictly sequential repeat loop.
//! Attempt 0 runs immediately; each further attempt waits out the policy's
//! backoff first. The loop is explicit — no recursion — and the final
//! failure surfaces unchanged.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use super::{Exchange, HandlerFuture, Middleware, Next, RETRY, RETRY_PRIORITY};
use crate::error::Error;

/// Re-runs failed attempts according to the request's retry policy.
pub struct RetryMiddleware;

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        RETRY
    }

    fn priority(&self) -> i32 {
        RETRY_PRIORITY
    }

    fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture {
        Box::pin(async move {
            let Some(policy) = exchange.request().retry.clone() else {
                return next.run(exchange).await;
            };

            let mut attempt: u32 = 0;
            loop {
                match next.clone().run(exchange.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(error) => {
                        let exhausted = attempt >= policy.times;
                        if exhausted || error.is_cancelled() || !policy.accepts(&error) {
                            return Err(error);
                        }

                        attempt += 1;
                        let wait = policy.delay_for(attempt);
                        debug!(
                            id = %exchange.request().request_id,
                            attempt,
                            ?wait,
                            error = %error,
                            "retrying request"
                        );
                        if let Some(observer) = &policy.on_retry {
                            observer(&error, attempt);
                        }
                        exchange.record_retry();

                        // The wait is cancel-aware so a cancelled request
                        // settles instead of sleeping out its backoff.
                        tokio::select! {
                            _ = exchange.cancel().cancelled() => return Err(Error::Cancelled),
                            _ = sleep(wait) => {}
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::http::{Request, Response, RetryPolicy};
    use crate::middleware::MiddlewareEngine;
    use crate::transport::{TransportError, transport_fn};

    async fn run(engine: &MiddlewareEngine, request: Request) -> crate::error::Result<Response> {
        engine
            .execute(Arc::new(Exchange::new(
                Arc::new(request),
                CancelToken::new(),
            )))
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_schedule() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = calls.clone();
        let engine = MiddlewareEngine::new(transport_fn(move |_, _| {
            recorder.lock().unwrap().push(Instant::now());
            async { Err(TransportError::Status {
                status: 503,
                body: Default::default(),
            }) }
        }));
        engine.register(Arc::new(RetryMiddleware));

        let result = run(
            &engine,
            Request::get("https://api.example.com/flaky")
                .retry(RetryPolicy::new(3, Duration::from_millis(1000))),
        )
        .await;

        let error = result.expect_err("permanently failing");
        assert_eq!(error.status(), Some(503));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            [
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn success_short_circuits_remaining_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let engine = MiddlewareEngine::new(transport_fn(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TransportError::Connect("reset".into()))
                } else {
                    Ok(Response::new(200))
                }
            }
        }));
        engine.register(Arc::new(RetryMiddleware));

        let response = run(
            &engine,
            Request::get("https://api.example.com/users")
                .retry(RetryPolicy::new(5, Duration::from_millis(10))),
        )
        .await
        .expect("second attempt succeeds");
        assert_eq!(response.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let engine = MiddlewareEngine::new(transport_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Status {
                status: 404,
                body: Default::default(),
            }) }
        }));
        engine.register(Arc::new(RetryMiddleware));

        let error = run(
            &engine,
            Request::get("https://api.example.com/users")
                .retry(RetryPolicy::new(3, Duration::from_millis(10))),
        )
        .await
        .expect_err("404 is terminal");
        assert_eq!(error.status(), Some(404));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_each_upcoming_attempt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = MiddlewareEngine::new(transport_fn(|_, _| async {
            Err(TransportError::Connect("refused".into()))
        }));
        engine.register(Arc::new(RetryMiddleware));

        let observed = seen.clone();
        let policy = RetryPolicy::new(2, Duration::from_millis(10)).on_retry(move |_, attempt| {
            observed.lock().unwrap().push(attempt);
        });
        let _ = run(
            &engine,
            Request::get("https://api.example.com/users").retry(policy),
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), [1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_predicate_overrides_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let engine = MiddlewareEngine::new(transport_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Connect("refused".into())) }
        }));
        engine.register(Arc::new(RetryMiddleware));

        // Connect errors are retryable by default; the predicate vetoes them.
        let policy = RetryPolicy::new(3, Duration::from_millis(10)).retry_if(|_| false);
        let _ = run(
            &engine,
            Request::get("https://api.example.com/users").retry(policy),
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
