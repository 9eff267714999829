//! # restflow
//!
//! An async Rust runtime for rate-limited JSON REST APIs.
//!
//! ## Features
//!
//! - Route templates with major-parameter aware rate-limit scoping
//! - Bucket-based rate limiter driven by `X-RateLimit-*` response headers,
//!   with a global gate and per-bucket FIFO dispatch
//! - Automatic retry of transient server errors and 429 re-queueing
//! - Deferred, chainable operations (`queue` / `submit` / `complete`) with
//!   map, flat_map, delay, zip and error-recovery operators
//! - Cursor-based pagination with an optional local cache
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use restflow::{RestAction, RestConfig, RestRuntime, Route};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = RestRuntime::new(
//!         RestConfig::new("https://discord.com/api/v10", "MyLib (v0.1)")?.token("Bot abc123"),
//!     )?;
//!
//!     let route = Route::get("channels/{channel_id}/messages")?
//!         .compile(&["111222333444555666"])?
//!         .with_query_params(&[("limit", "10")])?;
//!
//!     let messages: Vec<serde_json::Value> =
//!         RestAction::request_json(&runtime, route, None).submit().await?;
//!     println!("fetched {} messages", messages.len());
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod http;
pub mod pagination;
pub mod rate_limit;
pub mod request;
pub mod requester;
pub mod response;
pub mod route;
pub mod runtime;

mod util;

// Re-export commonly used types at crate root
pub use action::{RestAction, RestFuture};
pub use config::RestConfig;
pub use error::{ApiError, ErrorHandler, RestError, SchemaError, TransportError};
pub use http::{HttpClient, HttpRequest, HttpResponse, RequestBody};
pub use pagination::Paginator;
pub use rate_limit::{BucketRateLimiter, GlobalRateLimit, RateLimiter};
pub use response::RestResponse;
pub use route::{CompiledRoute, Method, Route};
pub use runtime::RestRuntime;

/// Result type alias using [`RestError`]
pub type Result<T> = std::result::Result<T, RestError>;
