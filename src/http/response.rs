//! The response handed back by the transport and fanned out by the
//! orchestrator.
//!
//! Responses are deliberately cheap to clone — the data buffer is a
//! [`Bytes`] handle — because cache hits, single-flight fan-out, and
//! debounce fan-out all hand the same payload to multiple callers.

use bytes::Bytes;

use super::Headers;

/// A transport response: status, headers, and an opaque data buffer.
///
/// # Examples
///
/// ```
/// use turnstile::Response;
///
/// let response = Response::new(200)
///     .with_header("Content-Type", "application/json")
///     .body("{\"id\":7}");
///
/// assert!(response.is_success());
/// assert_eq!(response.headers.get("content-type"), Some("application/json"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// The HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// The response payload.
    pub data: Bytes,
}

impl Response {
    /// Creates an empty response with the given status code.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            data: Bytes::new(),
        }
    }

    /// Adds a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the response payload.
    #[must_use]
    pub fn body(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Returns `true` for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserializes the payload as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.data)
    }
}
