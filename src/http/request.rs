//! The request descriptor and its per-request policies.
//!
//! A [`Request`] describes one outbound call: target, payload, and the
//! orchestration knobs — priority, caching, retry, deduplication, debounce,
//! middleware skips, and response validation. Descriptors are built with
//! chainable methods and are immutable once submitted (the orchestrator
//! holds them behind `Arc`).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use super::{Headers, Method, Response};
use crate::error::Error;

/// Priority assigned when the caller does not choose one (middle of the
/// conventional 0–10 range; higher runs sooner).
pub const DEFAULT_PRIORITY: i32 = 5;

/// Upper bound on a single computed retry delay.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Caller-supplied check that a 2xx response is also a *logical* success.
///
/// Returning `Err(reason)` fails the request with a validation error.
pub type Validator = Arc<dyn Fn(&Response) -> Result<(), String> + Send + Sync>;

/// Caller-supplied cache key derivation, replacing the default composition.
pub type KeyGenerator = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Predicate deciding whether a failed attempt should be retried.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Observer invoked before each retry wait, with the error and the
/// 1-based number of the upcoming attempt.
pub type RetryObserver = Arc<dyn Fn(&Error, u32) + Send + Sync>;

/// Per-request caching behavior.
///
/// Caching only ever applies to `GET` requests with 2xx outcomes; this
/// policy decides whether those are looked up and stored at all, and under
/// which TTL and key.
#[derive(Clone, Default)]
pub enum CachePolicy {
    /// Never read or write the cache for this request.
    #[default]
    Disabled,
    /// Serve from cache when fresh, store successful responses.
    Enabled {
        /// TTL for entries written by this request; the cache manager's
        /// default applies when `None`.
        ttl: Option<Duration>,
        /// Custom cache key derivation; the default composition of method,
        /// url, params, and body applies when `None`.
        key_generator: Option<KeyGenerator>,
    },
}

impl CachePolicy {
    /// Enabled with the manager's default TTL and the default key.
    pub fn enabled() -> Self {
        Self::Enabled {
            ttl: None,
            key_generator: None,
        }
    }

    /// Enabled with a per-request TTL and the default key.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::Enabled {
            ttl: Some(ttl),
            key_generator: None,
        }
    }

    /// Returns `true` unless the policy is [`CachePolicy::Disabled`].
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled { ttl, key_generator } => f
                .debug_struct("Enabled")
                .field("ttl", ttl)
                .field("custom_key", &key_generator.is_some())
                .finish(),
        }
    }
}

/// How the wait before the n-th retry grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// `delay × n` for the n-th retry.
    Linear,
    /// `delay × 2^(n−1)` for the n-th retry.
    #[default]
    Exponential,
}

/// Bounded-retry configuration for a request.
///
/// Attempt 0 always runs; up to `times` further attempts follow failures the
/// predicate accepts, separated by backoff waits.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use turnstile::{Backoff, RetryPolicy};
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(500))
///     .backoff(Backoff::Linear)
///     .retry_if(|err| err.is_timeout());
/// # let _ = policy;
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of *extra* attempts after the first.
    pub times: u32,
    /// Base wait between attempts.
    pub delay: Duration,
    /// Growth curve for the wait.
    pub backoff: Backoff,
    /// Which errors are worth retrying; [`Error::is_retryable`] when `None`.
    pub retryable: Option<RetryPredicate>,
    /// Called with the error and upcoming attempt number before each retry.
    pub on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    /// Creates a policy with exponential backoff and the default predicate.
    pub fn new(times: u32, delay: Duration) -> Self {
        Self {
            times,
            delay,
            backoff: Backoff::default(),
            retryable: None,
            on_retry: None,
        }
    }

    /// Sets the backoff curve.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the default retry predicate.
    #[must_use]
    pub fn retry_if(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Some(Arc::new(predicate));
        self
    }

    /// Installs an observer invoked before each retry wait.
    #[must_use]
    pub fn on_retry(mut self, observer: impl Fn(&Error, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// The wait before the `retry`-th retry (1-based), capped at 30s.
    pub(crate) fn delay_for(&self, retry: u32) -> Duration {
        let raw = match self.backoff {
            Backoff::Linear => self.delay.saturating_mul(retry),
            Backoff::Exponential => {
                let shift = retry.saturating_sub(1).min(31);
                self.delay.saturating_mul(1u32 << shift)
            }
        };
        raw.min(MAX_RETRY_DELAY)
    }

    /// Applies the configured or default predicate to `error`.
    pub(crate) fn accepts(&self, error: &Error) -> bool {
        match &self.retryable {
            Some(predicate) => predicate(error),
            None => error.is_retryable(),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("times", &self.times)
            .field("delay", &self.delay)
            .field("backoff", &self.backoff)
            .field("custom_predicate", &self.retryable.is_some())
            .finish()
    }
}

/// A description of one outbound request and how to orchestrate it.
///
/// Build with [`Request::get`] / [`Request::new`] and the chainable
/// configuration methods, then hand it to
/// [`Orchestrator::submit`](crate::Orchestrator::submit).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use turnstile::{CachePolicy, Request, RetryPolicy};
///
/// let request = Request::get("https://api.example.com/users")
///     .param("page", "2")
///     .priority(8)
///     .cache(CachePolicy::with_ttl(Duration::from_secs(60)))
///     .retry(RetryPolicy::new(2, Duration::from_millis(250)))
///     .request_lock(true);
/// # let _ = request;
/// ```
#[derive(Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: String,
    /// Query parameters, ordered for deterministic key derivation.
    pub params: BTreeMap<String, String>,
    /// Request body, if any.
    pub body: Option<Bytes>,
    /// Request headers.
    pub headers: Headers,
    /// Per-request deadline enforced around the transport call.
    pub timeout: Option<Duration>,
    /// Admission priority; higher runs sooner. Defaults to [`DEFAULT_PRIORITY`].
    pub priority: i32,
    /// Caching behavior.
    pub cache: CachePolicy,
    /// Retry behavior; `None` means a single attempt.
    pub retry: Option<RetryPolicy>,
    /// Identifier for cancellation and diagnostics; a fresh UUID by default.
    pub request_id: String,
    /// Identity for single-flight and debounce; derived from the request
    /// when `None`.
    pub dedup_key: Option<String>,
    /// Collapse bursts of this request into one trailing execution.
    pub debounce: bool,
    /// Share one in-flight execution among concurrent identical requests.
    pub request_lock: bool,
    /// Names of registered middlewares to bypass for this request.
    pub skip_middleware: HashSet<String>,
    /// Logical-success check applied to 2xx responses.
    pub validate: Option<Validator>,
}

impl Request {
    /// Creates a descriptor with the given method and URL and default
    /// orchestration settings.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        return Self {
            method,
            url: url.into(),
            params: BTreeMap::new(),
            body: None,
            headers: Headers::new(),
            timeout: None,
            priority: DEFAULT_PRIORITY,
            cache: CachePolicy::Disabled,
            retry: None,
            request_id: Uuid::new_v4().to_string(),
            dedup_key: None,
            debounce: false,
            request_lock: false,
            skip_middleware: HashSet::new(),
            validate: None,
        };
    }

    /// Creates a `GET` descriptor.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Creates a `POST` descriptor.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Adds a query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the admission priority (higher runs sooner).
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the caching policy.
    #[must_use]
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Overrides the generated request id.
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Overrides the derived deduplication key.
    #[must_use]
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Enables or disables trailing-edge debouncing.
    #[must_use]
    pub fn debounce(mut self, debounce: bool) -> Self {
        self.debounce = debounce;
        self
    }

    /// Enables or disables single-flight deduplication.
    #[must_use]
    pub fn request_lock(mut self, lock: bool) -> Self {
        self.request_lock = lock;
        self
    }

    /// Bypasses the named middleware for this request.
    #[must_use]
    pub fn skip_middleware(mut self, name: impl Into<String>) -> Self {
        self.skip_middleware.insert(name.into());
        self
    }

    /// Installs a logical-success validator.
    #[must_use]
    pub fn validate(
        mut self,
        validator: impl Fn(&Response) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(validator));
        self
    }

    /// The identity of this request for caching and deduplication: method,
    /// URL, serialized ordered params, and a body digest.
    ///
    /// Two descriptors targeting the same resource with the same inputs
    /// always produce the same key; this determinism is what makes cache
    /// hits and single-flight collapses correct.
    pub fn identity_key(&self) -> String {
        // BTreeMap<String, String> serialization cannot fail.
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        let body_digest = match &self.body {
            Some(body) => {
                let mut hasher = DefaultHasher::new();
                body.hash(&mut hasher);
                hasher.finish()
            }
            None => 0,
        };
        format!(
            "{}:{}?{}#{:016x}",
            self.method, self.url, params, body_digest
        )
    }

    /// The effective key for single-flight and debounce grouping.
    pub fn flight_key(&self) -> String {
        match &self.dedup_key {
            Some(key) => key.clone(),
            None => self.identity_key(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("params", &self.params)
            .field("priority", &self.priority)
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .field("request_id", &self.request_id)
            .field("debounce", &self.debounce)
            .field("request_lock", &self.request_lock)
            .finish_non_exhaustive()
    }
}
