//! Built-in instrumentation middleware.
//!
//! Outermost layer: logs one structured line per execution with the
//! outcome, elapsed time, retry count, and cache provenance. Purely
//! observational — it never alters the result.

use std::sync::Arc;

use tracing::debug;

use super::{Exchange, HandlerFuture, Middleware, Next, TIMING, TIMING_PRIORITY};

/// Logs timing and outcome for every execution that reaches the engine.
pub struct TimingMiddleware;

impl Middleware for TimingMiddleware {
    fn name(&self) -> &str {
        TIMING
    }

    fn priority(&self) -> i32 {
        TIMING_PRIORITY
    }

    fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture {
        Box::pin(async move {
            let result = next.run(exchange.clone()).await;
            let elapsed = exchange.started_at().elapsed();
            let request = exchange.request();
            match &result {
                Ok(response) => debug!(
                    id = %request.request_id,
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    retries = exchange.retry_count(),
                    from_cache = exchange.from_cache(),
                    ?elapsed,
                    "request completed"
                ),
                Err(error) => debug!(
                    id = %request.request_id,
                    method = %request.method,
                    url = %request.url,
                    error = %error,
                    retries = exchange.retry_count(),
                    ?elapsed,
                    "request failed"
                ),
            }
            result
        })
    }
}
