//! HTTP transport abstraction.
//!
//! The runtime performs every exchange through the [`HttpClient`] trait so
//! the concrete transport stays replaceable (tests plug in mocks, callers
//! may bring their own client). [`client::ReqwestHttpClient`] is the
//! bundled default.

mod client;

pub use client::ReqwestHttpClient;

use std::io::Read;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_ENCODING};
use tracing::error;

use crate::error::TransportError;
use crate::route::Method;

/// JSON content type attached to request bodies by default.
pub const MEDIA_TYPE_JSON: &str = "application/json; charset=utf-8";

/// An outbound request body: raw bytes plus their content type.
#[derive(Debug, Clone)]
pub struct RequestBody {
    content_type: String,
    bytes: Vec<u8>,
}

impl RequestBody {
    /// Create a body from raw bytes and a content type.
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Serialize a value to a JSON body.
    pub fn json<B: serde::Serialize>(value: &B) -> Result<Self, crate::error::RestError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::error::RestError::Parsing(e.to_string()))?;
        Ok(Self::new(MEDIA_TYPE_JSON, bytes))
    }

    /// An empty body, used when the method requires one and none was given.
    pub fn empty() -> Self {
        Self::new(MEDIA_TYPE_JSON, Vec::new())
    }

    /// The body's content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A single outbound HTTP request, assembled by the requester.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Ordered header list; names compare case-insensitively
    pub headers: Vec<(String, String)>,
    /// Optional body
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Set a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Append a header without touching existing values of the same name.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }
}

/// A completed HTTP exchange as seen by the runtime.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Canonical status reason, e.g. `Too Many Requests`
    pub message: String,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body bytes as received (decoding happens in [`decode_body`])
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Read a header as UTF-8, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Performs a single HTTP exchange.
///
/// Implementations return the raw (still-encoded) body; retries, rate-limit
/// interpretation and content decoding are the runtime's job.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send the request and collect the full response.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Decode a response body according to its `content-encoding` header.
///
/// Supports `gzip` and (raw) `deflate`. On decoding failure the raw bytes
/// are returned unchanged so callers can still surface them for
/// diagnostics.
pub fn decode_body(headers: &HeaderMap, raw: Vec<u8>) -> Vec<u8> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let decoded = if encoding.eq_ignore_ascii_case("gzip") {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map(|_| out)
    } else if encoding.eq_ignore_ascii_case("deflate") {
        let mut out = Vec::new();
        flate2::read::DeflateDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map(|_| out)
    } else {
        return raw;
    };

    match decoded {
        Ok(out) => out,
        Err(err) => {
            error!(
                encoding,
                error = %err,
                content = %String::from_utf8_lossy(&raw),
                "failed to decode response body, surfacing raw content"
            );
            raw
        }
    }
}
