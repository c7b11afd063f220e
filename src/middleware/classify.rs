//! Built-in error-classification middleware.
//!
//! The innermost layer and the chain's terminal catch. It normalizes every
//! failure into the crate taxonomy before the retry layer sees it:
//! non-2xx responses become status errors, validator rejections become
//! validation errors, and everything except cancellation is wrapped with
//! request context for diagnostics. It never converts a failure into a
//! success.

use std::sync::Arc;

use super::{CLASSIFY, CLASSIFY_PRIORITY, Exchange, HandlerFuture, Middleware, Next};
use crate::error::Error;
use crate::transport::TransportError;

/// Normalizes outcomes into the crate error taxonomy.
pub struct ClassifyMiddleware;

impl Middleware for ClassifyMiddleware {
    fn name(&self) -> &str {
        CLASSIFY
    }

    fn priority(&self) -> i32 {
        CLASSIFY_PRIORITY
    }

    fn handle(&self, exchange: Arc<Exchange>, next: Next) -> HandlerFuture {
        Box::pin(async move {
            let result = next.run(exchange.clone()).await;
            let request = exchange.request();

            let outcome = match result {
                Ok(response) if !response.is_success() => {
                    Err(Error::Transport(TransportError::Status {
                        status: response.status,
                        body: response.data.clone(),
                    }))
                }
                Ok(response) => match &request.validate {
                    Some(validator) => match validator(&response) {
                        Ok(()) => Ok(response),
                        Err(reason) => Err(Error::Validation { reason }),
                    },
                    None => Ok(response),
                },
                Err(error) => Err(error),
            };

            match outcome {
                Ok(response) => Ok(response),
                // Cancellation stays bare so callers can match it directly.
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(error @ Error::Wrapped { .. }) => Err(error),
                Err(source) => Err(Error::Wrapped {
                    method: request.method.clone(),
                    url: request.url.clone(),
                    request_id: request.request_id.clone(),
                    attempts: exchange.retry_count() + 1,
                    source: Box::new(source),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::http::{Request, Response};
    use crate::middleware::MiddlewareEngine;
    use crate::transport::transport_fn;

    async fn run(engine: &MiddlewareEngine, request: Request) -> crate::error::Result<Response> {
        engine
            .execute(Arc::new(Exchange::new(
                Arc::new(request),
                CancelToken::new(),
            )))
            .await
    }

    #[tokio::test]
    async fn non_success_statuses_become_errors() {
        let engine = MiddlewareEngine::new(transport_fn(|_, _| async {
            Ok(Response::new(503).body("unavailable"))
        }));
        engine.register(Arc::new(ClassifyMiddleware));

        let error = run(&engine, Request::get("https://api.example.com/users"))
            .await
            .expect_err("503 is a failure");
        assert_eq!(error.status(), Some(503));
        assert!(matches!(error, Error::Wrapped { .. }));
    }

    #[tokio::test]
    async fn validator_rejections_become_validation_errors() {
        let engine = MiddlewareEngine::new(transport_fn(|_, _| async {
            Ok(Response::new(200).body("{\"ok\":false}"))
        }));
        engine.register(Arc::new(ClassifyMiddleware));

        let error = run(
            &engine,
            Request::get("https://api.example.com/users").validate(|response| {
                if response.data.as_ref().contains(&b'f') {
                    Err("logical failure flagged by body".to_owned())
                } else {
                    Ok(())
                }
            }),
        )
        .await
        .expect_err("validator rejects");
        assert!(matches!(error.root(), Error::Validation { .. }));
    }

    #[tokio::test]
    async fn transport_errors_gain_request_context() {
        let engine = MiddlewareEngine::new(transport_fn(|_, _| async {
            Err(TransportError::Connect("refused".into()))
        }));
        engine.register(Arc::new(ClassifyMiddleware));

        let error = run(
            &engine,
            Request::get("https://api.example.com/users").request_id("req-42"),
        )
        .await
        .expect_err("connect failure");
        match &error {
            Error::Wrapped {
                request_id,
                attempts,
                ..
            } => {
                assert_eq!(request_id, "req-42");
                assert_eq!(*attempts, 1);
            }
            other => panic!("expected wrapped error, got {other:?}"),
        }
        assert!(error.is_connect());
    }

    #[tokio::test]
    async fn successes_pass_through_untouched() {
        let engine = MiddlewareEngine::new(transport_fn(|_, _| async {
            Ok(Response::new(201).body("created"))
        }));
        engine.register(Arc::new(ClassifyMiddleware));

        let response = run(&engine, Request::post("https://api.example.com/users"))
            .await
            .expect("2xx passes");
        assert_eq!(response.status, 201);
    }
}
