//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use url::Url;

use crate::error::RestError;
use crate::http::{HttpClient, HttpRequest, ReqwestHttpClient};
use crate::rate_limit::{BucketRateLimiter, RateLimitContext, RateLimiter};

/// Fallback success callback used when `queue` is given none.
pub type DefaultSuccess = Arc<dyn Fn() + Send + Sync>;

/// Fallback failure callback used when `queue` is given none.
pub type DefaultFailure = Arc<dyn Fn(&RestError) + Send + Sync>;

/// Builds the rate limiter when the runtime is constructed.
pub type RateLimiterFactory =
    Arc<dyn Fn(RateLimitContext) -> Arc<dyn RateLimiter> + Send + Sync>;

/// Hook invoked on every outbound request just before it is sent.
pub type RequestHook = Arc<dyn Fn(&mut HttpRequest) + Send + Sync>;

/// Configuration record for [`RestRuntime`](crate::RestRuntime).
///
/// # Example
///
/// ```rust,no_run
/// use restflow::config::RestConfig;
///
/// let config = RestConfig::new("https://discord.com/api/v10", "MyLib (v0.1)")?
///     .token("Bot abc123")
///     .retry_on_timeout(true);
/// # Ok::<(), restflow::RestError>(())
/// ```
#[derive(Clone)]
pub struct RestConfig {
    pub(crate) http_client: Arc<dyn HttpClient>,
    pub(crate) base_url: String,
    pub(crate) user_agent: String,
    pub(crate) token: Option<String>,
    pub(crate) rate_limiter_factory: RateLimiterFactory,
    pub(crate) custom_request_builder: Option<RequestHook>,
    pub(crate) relative_rate_limit: bool,
    pub(crate) retry_on_timeout: bool,
    pub(crate) callback_pool: Option<Handle>,
    pub(crate) rate_limit_pool: Option<Handle>,
    pub(crate) default_success: DefaultSuccess,
    pub(crate) default_failure: DefaultFailure,
    pub(crate) default_timeout_ms: i64,
}

impl RestConfig {
    /// Create a configuration with the two required settings.
    ///
    /// The base URL must start with `http` and is normalized to end with a
    /// slash; the user agent must not be blank.
    pub fn new(
        base_url: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Result<Self, RestError> {
        let base_url = normalize_base_url(base_url.into())?;
        let user_agent = user_agent.into();
        if user_agent.trim().is_empty() {
            return Err(RestError::InvalidArgument(
                "user agent may not be blank".into(),
            ));
        }

        Ok(Self {
            http_client: Arc::new(ReqwestHttpClient::new()),
            base_url,
            user_agent,
            token: None,
            rate_limiter_factory: Arc::new(|context| {
                let limiter: Arc<dyn RateLimiter> = BucketRateLimiter::new(context);
                limiter
            }),
            custom_request_builder: None,
            relative_rate_limit: true,
            retry_on_timeout: false,
            callback_pool: None,
            rate_limit_pool: None,
            default_success: Arc::new(|| {}),
            default_failure: Arc::new(crate::action::log_failure),
            default_timeout_ms: 0,
        })
    }

    /// Replace the HTTP transport.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = client;
        self
    }

    /// Set the `authorization` header value for routes requiring auth.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Replace the rate limiter implementation.
    pub fn rate_limiter_factory(
        mut self,
        factory: impl Fn(RateLimitContext) -> Arc<dyn RateLimiter> + Send + Sync + 'static,
    ) -> Self {
        self.rate_limiter_factory = Arc::new(factory);
        self
    }

    /// Install a hook that may adjust every outbound request (for example
    /// to inject headers) just before it is sent.
    pub fn custom_request_builder(
        mut self,
        hook: impl Fn(&mut HttpRequest) + Send + Sync + 'static,
    ) -> Self {
        self.custom_request_builder = Some(Arc::new(hook));
        self
    }

    /// Select which reset header drives bucket state: `true` (default)
    /// reads `X-RateLimit-Reset-After`, `false` reads the absolute
    /// `X-RateLimit-Reset` timestamp.
    pub fn relative_rate_limit(mut self, relative: bool) -> Self {
        self.relative_rate_limit = relative;
        self
    }

    /// Retry once on transient network failures (connect/timeout/TLS).
    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Run callbacks on this runtime instead of the ambient one.
    pub fn callback_pool(mut self, handle: Handle) -> Self {
        self.callback_pool = Some(handle);
        self
    }

    /// Run bucket workers and cleanup on this runtime instead of the
    /// ambient one.
    pub fn rate_limit_pool(mut self, handle: Handle) -> Self {
        self.rate_limit_pool = Some(handle);
        self
    }

    /// Fallback callback when `queue` is called without a success handler.
    pub fn default_success(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.default_success = Arc::new(callback);
        self
    }

    /// Fallback callback when `queue` is called without a failure handler.
    pub fn default_failure(
        mut self,
        callback: impl Fn(&RestError) + Send + Sync + 'static,
    ) -> Self {
        self.default_failure = Arc::new(callback);
        self
    }

    /// Deadline applied to actions that do not set one (disabled by default).
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as i64;
        self
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The configured user agent.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

impl std::fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("has_token", &self.token.is_some())
            .field("relative_rate_limit", &self.relative_rate_limit)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish()
    }
}

fn normalize_base_url(base_url: String) -> Result<String, RestError> {
    if base_url.len() < 4 || !base_url[..4].eq_ignore_ascii_case("http") {
        return Err(RestError::InvalidArgument(format!(
            "base URL must be HTTP(S): '{}'",
            base_url
        )));
    }
    Url::parse(&base_url)
        .map_err(|e| RestError::InvalidArgument(format!("invalid base URL '{}': {}", base_url, e)))?;

    if base_url.ends_with('/') {
        Ok(base_url)
    } else {
        Ok(format!("{}/", base_url))
    }
}
