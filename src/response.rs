//! Response envelope delivered to request handlers.

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{RestError, TransportError};
use crate::http::{decode_body, HttpResponse};

/// Status code used when a response represents a transport failure.
pub const ERROR_CODE: i32 = -1;

/// A completed exchange (or transport failure) as seen by a request handler.
///
/// The body is held as decoded bytes and only parsed when asked for, so
/// handlers that ignore the payload never pay for JSON parsing.
#[derive(Debug)]
pub struct RestResponse {
    code: i32,
    message: String,
    retry_after: i64,
    headers: HeaderMap,
    body: Vec<u8>,
    exception: Option<TransportError>,
    cf_rays: Vec<String>,
}

impl RestResponse {
    /// Wrap a transport-level response.
    ///
    /// `retry_after` is the rate-limit delay in milliseconds, `-1` when the
    /// response was not rate limited.
    pub fn from_http(response: HttpResponse, retry_after: i64, cf_rays: Vec<String>) -> Self {
        let HttpResponse {
            status,
            message,
            headers,
            body,
        } = response;
        let body = decode_body(&headers, body);
        Self {
            code: i32::from(status),
            message,
            retry_after,
            headers,
            body,
            exception: None,
            cf_rays,
        }
    }

    /// Wrap a transport failure.
    pub fn from_error(error: TransportError, cf_rays: Vec<String>) -> Self {
        Self {
            code: ERROR_CODE,
            message: "ERROR".to_string(),
            retry_after: -1,
            headers: HeaderMap::new(),
            body: Vec::new(),
            exception: Some(error),
            cf_rays,
        }
    }

    /// Synthesize a 429 for locally-handled rate limits (no exchange happened).
    pub fn rate_limited(retry_after: i64) -> Self {
        Self {
            code: 429,
            message: "TOO MANY REQUESTS".to_string(),
            retry_after,
            headers: HeaderMap::new(),
            body: Vec::new(),
            exception: None,
            cf_rays: Vec::new(),
        }
    }

    /// HTTP status code, or [`ERROR_CODE`] for transport failures.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Status reason phrase.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Rate-limit delay in milliseconds; `-1` when not rate limited.
    pub fn retry_after(&self) -> i64 {
        self.retry_after
    }

    /// Raise the retry-after once the body-provided value is known.
    pub(crate) fn set_retry_after(&mut self, retry_after: i64) {
        self.retry_after = retry_after;
    }

    /// `true` for 2xx responses.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// `true` for 429 responses.
    pub fn is_rate_limit(&self) -> bool {
        self.code == 429
    }

    /// `true` when this response holds a transport failure.
    pub fn is_error(&self) -> bool {
        self.code == ERROR_CODE
    }

    /// The transport failure, if any.
    pub fn exception(&self) -> Option<&TransportError> {
        self.exception.as_ref()
    }

    /// `CF-RAY` identifiers collected across attempts, in order of receipt.
    pub fn cf_rays(&self) -> &[String] {
        &self.cf_rays
    }

    /// Read a response header as UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// The decoded body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body as text, or `"N/A"` when empty.
    pub fn body_text(&self) -> String {
        if self.body.is_empty() {
            "N/A".to_string()
        } else {
            String::from_utf8_lossy(&self.body).into_owned()
        }
    }

    /// Parse the body into a typed value.
    pub fn parse<D: DeserializeOwned>(&self) -> Result<D, RestError> {
        serde_json::from_slice(&self.body).map_err(|e| RestError::Parsing(e.to_string()))
    }

    /// Parse the body as a loose JSON value.
    pub fn json(&self) -> Result<Value, RestError> {
        self.parse()
    }

    /// Whether the response declared a JSON content type.
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|value| value.starts_with("application/json"))
    }
}

impl std::fmt::Display for RestResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.exception {
            Some(error) => write!(f, "HttpException[{}]", error),
            None => write!(f, "HttpResponse[{}]", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, body: &[u8]) -> HttpResponse {
        HttpResponse {
            status,
            message: "OK".into(),
            headers: HeaderMap::new(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_status_predicates() {
        assert!(RestResponse::from_http(http(204, b""), -1, vec![]).is_ok());
        assert!(!RestResponse::from_http(http(404, b""), -1, vec![]).is_ok());
        assert!(RestResponse::rate_limited(1000).is_rate_limit());
        assert!(RestResponse::from_error(TransportError::Io("broken".into()), vec![]).is_error());
    }

    #[test]
    fn test_parse_typed_body() {
        let response = RestResponse::from_http(http(200, br#"[1, 2, 3]"#), -1, vec![]);
        let values: Vec<u32> = response.parse().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_failure_is_parsing_error() {
        let response = RestResponse::from_http(http(200, b"not json"), -1, vec![]);
        assert!(matches!(
            response.parse::<Vec<u32>>(),
            Err(RestError::Parsing(_))
        ));
    }

    #[test]
    fn test_body_text_fallback() {
        let response = RestResponse::from_http(http(200, b""), -1, vec![]);
        assert_eq!(response.body_text(), "N/A");
    }
}
