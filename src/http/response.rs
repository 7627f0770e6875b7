//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses, and read
//! access for middleware that needs to capture a response after the handler
//! ran. Writing it to the wire is left to the transport.

use super::{Headers, StatusCode};

/// An HTTP/1.1 response as produced by a handler.
///
/// # Examples
///
/// ```
/// use rttp_idempotency::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Created)
///     .header("Content-Type", "application/json")
///     .body(r#"{"id":42}"#);
///
/// assert_eq!(response.content(), br#"{"id":42}"#);
/// assert_eq!(response.content_type(), Some("application/json"));
/// assert_eq!(response.status().as_u16(), 201);
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Creates a response carrying `value` serialized as JSON.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status)
            .header("Content-Type", "application/json")
            .body(value.to_string())
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the headers set so far.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn content(&self) -> &[u8] {
        &self.body
    }

    /// Returns the explicitly set `Content-Type`, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}
