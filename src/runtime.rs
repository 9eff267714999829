//! Runtime assembly: config, transport, requester and rate limiter.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::RestConfig;
use crate::error::RestError;
use crate::rate_limit::{GlobalRateLimit, RateLimitContext, RateLimiter};
use crate::request::RestRequest;
use crate::requester::Requester;

/// Handle to a running request runtime.
///
/// Cheap to clone; all clones share the same scheduler state. Construct
/// actions with [`RestAction::request`](crate::RestAction::request) and
/// friends, passing this runtime.
///
/// # Example
///
/// ```rust,no_run
/// use restflow::{RestConfig, RestRuntime, RestAction, Route};
///
/// # async fn run() -> Result<(), restflow::RestError> {
/// let runtime = RestRuntime::new(
///     RestConfig::new("https://discord.com/api/v10", "MyLib (v0.1)")?.token("Bot abc"),
/// )?;
///
/// let route = Route::get("channels/{channel_id}/messages")?.compile(&["111"])?;
/// let messages: Vec<serde_json::Value> =
///     RestAction::request_json(&runtime, route, None).submit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RestRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RestConfig,
    requester: Arc<Requester>,
    rate_limiter: Arc<dyn RateLimiter>,
    global: Arc<GlobalRateLimit>,
    callback_pool: Handle,
    rate_limit_pool: Handle,
}

impl RestRuntime {
    /// Build a runtime from its configuration.
    ///
    /// Fails with [`RestError::InvalidState`] when called outside a tokio
    /// runtime and no explicit pools were configured.
    pub fn new(config: RestConfig) -> Result<Self, RestError> {
        let ambient = Handle::try_current().ok();
        let resolve = |configured: &Option<Handle>| {
            configured.clone().or_else(|| ambient.clone()).ok_or_else(|| {
                RestError::InvalidState(
                    "runtime must be created inside a tokio runtime or be given executor handles"
                        .into(),
                )
            })
        };
        let callback_pool = resolve(&config.callback_pool)?;
        let rate_limit_pool = resolve(&config.rate_limit_pool)?;

        let global = Arc::new(GlobalRateLimit::new());
        let requester = Arc::new(Requester::new(&config));
        let rate_limiter = (config.rate_limiter_factory)(RateLimitContext {
            requester: requester.clone(),
            pool: rate_limit_pool.clone(),
            global: global.clone(),
            relative_rate_limit: config.relative_rate_limit,
        });
        requester.bind_rate_limiter(rate_limiter.clone());

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                requester,
                rate_limiter,
                global,
                callback_pool,
                rate_limit_pool,
            }),
        })
    }

    /// Hand a request to the scheduler, or execute it directly when it asks
    /// for local rate-limit handling.
    pub(crate) fn request(&self, request: Arc<RestRequest>) -> Result<(), RestError> {
        if self.inner.rate_limiter.is_shutdown() {
            return Err(RestError::InvalidState(
                "the requester has been stopped, no new requests can be queued".into(),
            ));
        }

        if request.handles_rate_limit_locally() {
            let requester = self.inner.requester.clone();
            self.inner.rate_limit_pool.spawn(async move {
                if let Err(error) = requester.execute(&request, true).await {
                    request.fail(error);
                }
            });
            Ok(())
        } else {
            self.inner.rate_limiter.queue(request)
        }
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// The shared global rate-limit gate.
    pub fn global_rate_limit(&self) -> &Arc<GlobalRateLimit> {
        &self.inner.global
    }

    /// The installed rate limiter.
    pub fn rate_limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.inner.rate_limiter
    }

    /// The pool running user callbacks.
    pub(crate) fn callback_pool(&self) -> &Handle {
        &self.inner.callback_pool
    }

    /// The pool running bucket workers.
    pub(crate) fn rate_limit_pool(&self) -> &Handle {
        &self.inner.rate_limit_pool
    }

    /// Cancel every queued request that is not priority; returns the count.
    pub fn cancel_requests(&self) -> Result<usize, RestError> {
        self.inner.rate_limiter.cancel_all()
    }

    /// Stop accepting new requests and let queued buckets drain.
    pub fn shutdown(&self) {
        self.inner.rate_limiter.shutdown();
    }

    /// Whether [`shutdown`](RestRuntime::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.rate_limiter.is_shutdown()
    }
}

impl std::fmt::Debug for RestRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRuntime")
            .field("base_url", &self.inner.config.base_url())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
