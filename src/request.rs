//! Queued work items and callback delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::error;

use crate::error::RestError;
use crate::http::RequestBody;
use crate::response::RestResponse;
use crate::route::CompiledRoute;
use crate::util::now_ms;

tokio::task_local! {
    static CALLBACK_CONTEXT: ();
}

/// Whether the current task is running user callbacks.
///
/// Used by `complete()` to refuse blocking joins that would deadlock the
/// callback pool.
pub(crate) fn in_callback_context() -> bool {
    CALLBACK_CONTEXT.try_with(|_| ()).is_ok()
}

/// Run a future with the callback-context flag set, so `complete()` inside
/// it is rejected.
pub(crate) fn in_callback_scope<F>(future: F) -> impl std::future::Future<Output = F::Output>
where
    F: std::future::Future,
{
    CALLBACK_CONTEXT.scope((), future)
}

/// The terminal outcome handed to a request's consumer.
pub(crate) type Outcome = Result<RestResponse, RestError>;

type Consumer = Box<dyn FnOnce(Outcome) + Send>;
type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// A single queued API call tracked by the rate limiter.
///
/// The consumer fires at most once across all completion paths; `done` and
/// `cancelled` are atomics so cancellation may race delivery safely.
pub struct RestRequest {
    route: CompiledRoute,
    body: Option<RequestBody>,
    headers: Vec<(String, String)>,
    deadline: i64,
    priority: bool,
    handle_rate_limit_locally: bool,
    cancelled: AtomicBool,
    done: AtomicBool,
    check: Option<CheckFn>,
    consumer: Mutex<Option<Consumer>>,
    callback_pool: Handle,
}

impl RestRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        route: CompiledRoute,
        body: Option<RequestBody>,
        headers: Vec<(String, String)>,
        deadline: i64,
        priority: bool,
        handle_rate_limit_locally: bool,
        check: Option<CheckFn>,
        consumer: Consumer,
        callback_pool: Handle,
    ) -> Self {
        Self {
            route,
            body,
            headers,
            deadline,
            priority,
            handle_rate_limit_locally,
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            check,
            consumer: Mutex::new(Some(consumer)),
            callback_pool,
        }
    }

    /// The compiled route this request targets.
    pub fn route(&self) -> &CompiledRoute {
        &self.route
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Custom headers, in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Absolute deadline in epoch milliseconds; 0 means none.
    pub fn deadline(&self) -> i64 {
        self.deadline
    }

    /// Priority requests survive [`cancel_all`](crate::RestRuntime::cancel_requests).
    pub fn is_priority(&self) -> bool {
        self.priority
    }

    /// Whether the caller asked for 429s to be delivered instead of re-queued.
    pub fn handles_rate_limit_locally(&self) -> bool {
        self.handle_rate_limit_locally
    }

    /// Cancel the request; delivers a `Cancelled` failure unless already done.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.fail(RestError::Cancelled);
        }
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether a callback has already fired.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn is_timed_out(&self) -> bool {
        self.deadline > 0 && self.deadline < now_ms()
    }

    /// Consulted before transport dispatch; fires the appropriate failure
    /// and returns `true` when the request must not be sent.
    pub fn is_skipped(&self) -> bool {
        if self.is_timed_out() {
            self.fail(RestError::Timeout);
            return true;
        }
        let check_failed = self
            .check
            .as_ref()
            .is_some_and(|check| !check());
        if self.is_cancelled() || check_failed {
            self.fail(RestError::Cancelled);
            return true;
        }
        false
    }

    /// Deliver a response to the consumer on the callback pool.
    pub(crate) fn handle_response(&self, response: RestResponse) {
        self.deliver(Ok(response));
    }

    /// Deliver a failure to the consumer on the callback pool.
    pub(crate) fn fail(&self, error: RestError) {
        self.deliver(Err(error));
    }

    fn deliver(&self, outcome: Outcome) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(consumer) = self.consumer.lock().take() else {
            return;
        };
        self.callback_pool.spawn(CALLBACK_CONTEXT.scope((), async move {
            consumer(outcome);
        }));
    }
}

impl std::fmt::Debug for RestRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestRequest")
            .field("route", &self.route.to_string())
            .field("deadline", &self.deadline)
            .field("priority", &self.priority)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

/// Log a consumer panic without poisoning the callback pool.
pub(crate) fn guard_consumer<F: FnOnce()>(stage: &str, f: F) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic".to_string());
        error!(stage, panic = %message, "encountered error while processing callback");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::route::Route;

    fn request_with_counter(
        deadline: i64,
        check: Option<CheckFn>,
    ) -> (Arc<RestRequest>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let route = Route::get("gateway").unwrap().compile(&[]).unwrap();
        let request = Arc::new(RestRequest::new(
            route,
            None,
            Vec::new(),
            deadline,
            false,
            false,
            check,
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            Handle::current(),
        ));
        (request, fired)
    }

    #[tokio::test]
    async fn test_callbacks_fire_at_most_once() {
        let (request, fired) = request_with_counter(0, None);

        request.handle_response(RestResponse::rate_limited(0));
        request.fail(RestError::Cancelled);
        request.cancel();

        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_skips() {
        let (request, fired) = request_with_counter(now_ms() - 10, None);
        assert!(request.is_skipped());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_check_skips() {
        let check: CheckFn = Arc::new(|| false);
        let (request, _) = request_with_counter(0, Some(check));
        assert!(request.is_skipped());
    }

    #[tokio::test]
    async fn test_live_request_not_skipped() {
        let (request, fired) = request_with_counter(now_ms() + 60_000, None);
        assert!(!request.is_skipped());

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
