//! Built-in cache-check middleware.
//!
//! Sits outside retry so a hit costs nothing: fresh entries short-circuit
//! the rest of the chain and the transport entirely. Only idempotent reads
//! participate (`GET`), and only 2xx responses are stored.

use std::sync::Arc;

use super::{CACHE, CACHE_PRIORITY, Exchange, HandlerFuture, Middleware, Next};
use crate::cache::CacheManager;
use crate::http::{CachePolicy, Method};

/// Serves fresh cached responses and stores new cacheable ones.
pub struct CacheMiddleware {
    manager: Arc<CacheManager>,
}

impl CacheMiddleware {
    /// Creates the middleware over a shared cache manager.
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self { manager }
    }
}

impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        CACHE
    }

    fn priority(&self) -> i32 {
        CACHE_PRIORITY
    }

    fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture {
        let manager = self.manager.clone();
        Box::pin(async move {
            let request = exchange.request().clone();
            let ttl = match &request.cache {
                CachePolicy::Enabled { ttl, .. } if request.method == Method::Get => *ttl,
                _ => return next.run(exchange).await,
            };

            let key = manager.key_for(&request);
            if let Some(hit) = manager.get(&key) {
                exchange.mark_cache_hit();
                return Ok(hit);
            }

            let response = next.run(exchange).await?;
            if response.is_success() {
                manager.set(key, response.clone(), ttl);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::cancel::CancelToken;
    use crate::http::{Request, Response};
    use crate::middleware::MiddlewareEngine;
    use crate::transport::transport_fn;

    fn engine_with_cache(hits: Arc<AtomicU32>) -> (MiddlewareEngine, Arc<CacheManager>) {
        let manager = Arc::new(CacheManager::new(CacheConfig::default()));
        let engine = MiddlewareEngine::new(transport_fn(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            async { Ok(Response::new(200).body("fresh")) }
        }));
        engine.register(Arc::new(CacheMiddleware::new(manager.clone())));
        (engine, manager)
    }

    async fn run(engine: &MiddlewareEngine, request: Request) -> Response {
        engine
            .execute(Arc::new(Exchange::new(
                Arc::new(request),
                CancelToken::new(),
            )))
            .await
            .expect("execution result")
    }

    #[tokio::test(start_paused = true)]
    async fn second_read_is_served_without_the_transport() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, _) = engine_with_cache(calls.clone());

        let request =
            || Request::get("https://api.example.com/users").cache(CachePolicy::enabled());
        run(&engine, request()).await;
        run(&engine, request()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_reaches_the_transport_again() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, _) = engine_with_cache(calls.clone());

        let request = || {
            Request::get("https://api.example.com/users")
                .cache(CachePolicy::with_ttl(Duration::from_millis(1000)))
        };
        run(&engine, request()).await;
        tokio::time::advance(Duration::from_millis(1100)).await;
        run(&engine, request()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_get_requests_bypass_the_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, manager) = engine_with_cache(calls.clone());

        let request = || {
            Request::post("https://api.example.com/users")
                .body("{}")
                .cache(CachePolicy::enabled())
        };
        run(&engine, request()).await;
        run(&engine, request()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_policy_bypasses_the_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let (engine, manager) = engine_with_cache(calls.clone());

        run(&engine, Request::get("https://api.example.com/users")).await;
        run(&engine, Request::get("https://api.example.com/users")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.stats().size, 0);
    }
}
