//! Error types for the request runtime.

use serde_json::Value;
use thiserror::Error;

/// The main error type surfaced to callbacks and futures.
#[derive(Error, Debug)]
pub enum RestError {
    /// Transport-level failure not recoverable by the built-in retry
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request deadline passed before dispatch
    #[error("request timed out")]
    Timeout,

    /// The request was cancelled or a pre-flight check returned false
    #[error("request was cancelled")]
    Cancelled,

    /// A 429 surfaced to the caller (only when local handling was requested)
    #[error("rate limited on {route}, retry after {retry_after_ms} ms")]
    RateLimited {
        /// Route identifier (`METHOD/template`)
        route: String,
        /// Suggested wait in milliseconds before retrying
        retry_after_ms: i64,
    },

    /// The API rejected the request (4xx other than 429, or 5xx after retry exhaustion)
    #[error("API error: {0}")]
    Api(ApiError),

    /// The response body could not be decoded into the expected shape
    #[error("failed to parse response body: {0}")]
    Parsing(String),

    /// Misuse of the runtime (blocking inside callbacks, stopped runtime, lock failure)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Validation failure in route compilation, query building or pagination
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RestError {
    /// Whether this error ends a request quietly enough to log at debug level.
    pub fn is_benign(&self) -> bool {
        matches!(self, RestError::Cancelled | RestError::Timeout)
    }

    /// The API-level numeric error code, if this is an [`RestError::Api`].
    pub fn api_code(&self) -> Option<i64> {
        match self {
            RestError::Api(api) => Some(api.code),
            _ => None,
        }
    }
}

/// Transport failures reported by the [`HttpClient`](crate::http::HttpClient).
///
/// The payloads are plain strings so a response holding an error stays cheap
/// to move between the requester and the callback pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// DNS resolution failed
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// The connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// The exchange timed out
    #[error("request timed out: {0}")]
    Timeout(String),

    /// TLS negotiation failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Any other I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Errors eligible for the single `retry_on_timeout` re-attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Connect(_) | TransportError::Timeout(_) | TransportError::Tls(_)
        )
    }
}

/// An error response returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status code of the response
    pub status: u16,
    /// API-level numeric code parsed from the JSON `code` field (0 when absent)
    pub code: i64,
    /// Human-readable message parsed from the JSON `message` field
    pub message: String,
    /// Field-level validation errors parsed from the nested `errors` object
    pub schema_errors: Vec<SchemaError>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.status, self.code, self.message)?;
        for schema in &self.schema_errors {
            write!(f, "\n{}", schema)?;
        }
        Ok(())
    }
}

impl ApiError {
    /// Create a new API error from status, code and message.
    pub fn new(status: u16, code: i64, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            schema_errors: Vec::new(),
        }
    }

    /// Parse an API error from a JSON error body.
    ///
    /// The expected shape is `{"code": 50013, "message": "...", "errors": {...}}`
    /// where `errors` is an arbitrarily nested object whose leaves carry an
    /// `_errors` array of `{"code": "...", "message": "..."}` records. A body
    /// that is not valid JSON falls back to the raw text as the message.
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            return Self::new(status, 0, String::from_utf8_lossy(body).into_owned());
        };

        let code = value.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();

        let mut schema_errors = Vec::new();
        if let Some(errors) = value.get("errors") {
            collect_schema_errors(errors, &mut String::new(), &mut schema_errors);
        }

        Self {
            status,
            code,
            message,
            schema_errors,
        }
    }

    /// Whether the remote reported a server-side failure.
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// A single field-level validation failure inside an [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    /// Path of the offending field, e.g. `embeds[0].fields[1].name`
    pub path: String,
    /// Machine code and message pairs reported for the field
    pub errors: Vec<(String, String)>,
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.path)?;
        for (code, message) in &self.errors {
            write!(f, " [{}] {}", code, message)?;
        }
        Ok(())
    }
}

fn collect_schema_errors(value: &Value, path: &mut String, out: &mut Vec<SchemaError>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::Array(leaf)) = map.get("_errors") {
                let errors = leaf
                    .iter()
                    .map(|entry| {
                        let code = entry
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let message = entry
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        (code, message)
                    })
                    .collect();
                out.push(SchemaError {
                    path: path.clone(),
                    errors,
                });
                return;
            }
            for (key, child) in map {
                let saved = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(key);
                collect_schema_errors(child, path, out);
                path.truncate(saved);
            }
        }
        Value::Array(entries) => {
            for (index, child) in entries.iter().enumerate() {
                let saved = path.len();
                path.push('[');
                path.push_str(&index.to_string());
                path.push(']');
                collect_schema_errors(child, path, out);
                path.truncate(saved);
            }
        }
        _ => {}
    }
}

type ErrorPredicate = Box<dyn Fn(&RestError) -> bool + Send + Sync>;
type ErrorConsumer = Box<dyn Fn(&RestError) + Send + Sync>;

/// Composable failure callback for [`RestAction::queue`](crate::RestAction::queue).
///
/// Each registered `(predicate, consumer)` case runs when its predicate
/// matches the error; the base consumer runs unconditionally at the end.
///
/// # Example
///
/// ```rust,ignore
/// action.queue_with(
///     |value| println!("done: {value:?}"),
///     ErrorHandler::new()
///         .ignore_codes(&[10008]) // unknown message, fine to miss
///         .handle(
///             |e| matches!(e, RestError::Timeout),
///             |_| eprintln!("gave up waiting"),
///         )
///         .into_callback(),
/// );
/// ```
pub struct ErrorHandler {
    base: ErrorConsumer,
    cases: Vec<(ErrorPredicate, ErrorConsumer)>,
}

impl ErrorHandler {
    /// Create a handler whose base consumer logs like the runtime default.
    pub fn new() -> Self {
        Self::with_base(crate::action::log_failure)
    }

    /// Create a handler with an explicit base consumer.
    pub fn with_base(base: impl Fn(&RestError) + Send + Sync + 'static) -> Self {
        Self {
            base: Box::new(base),
            cases: Vec::new(),
        }
    }

    /// Silently swallow errors matching the predicate.
    pub fn ignore(self, condition: impl Fn(&RestError) -> bool + Send + Sync + 'static) -> Self {
        self.handle(condition, |_| {})
    }

    /// Silently swallow API errors with any of the given numeric codes.
    pub fn ignore_codes(self, codes: &[i64]) -> Self {
        let codes = codes.to_vec();
        self.ignore(move |error| error.api_code().is_some_and(|code| codes.contains(&code)))
    }

    /// Run `consumer` when the predicate matches.
    pub fn handle(
        mut self,
        condition: impl Fn(&RestError) -> bool + Send + Sync + 'static,
        consumer: impl Fn(&RestError) + Send + Sync + 'static,
    ) -> Self {
        self.cases.push((Box::new(condition), Box::new(consumer)));
        self
    }

    /// Apply all matching cases, then the base consumer.
    pub fn accept(&self, error: &RestError) {
        for (condition, consumer) in &self.cases {
            if condition(error) {
                consumer(error);
            }
        }
        (self.base)(error);
    }

    /// Adapt into the failure callback shape expected by `queue`.
    pub fn into_callback(self) -> impl FnOnce(RestError) + Send + 'static {
        move |error| self.accept(&error)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}
