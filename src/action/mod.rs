//! Deferred, chainable API operations.
//!
//! A [`RestAction`] describes an API call without executing it. Terminal
//! operations start it: [`queue`](RestAction::queue) and friends dispatch
//! with callbacks, [`submit`](RestAction::submit) returns a future,
//! [`complete`](RestAction::complete) blocks. Operators
//! ([`map`](RestAction::map), [`flat_map`](RestAction::flat_map), ...)
//! build derived actions without dispatching anything.

mod operators;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{ApiError, RestError};
use crate::http::RequestBody;
use crate::request::{guard_consumer, in_callback_context, Outcome, RestRequest};
use crate::response::RestResponse;
use crate::route::CompiledRoute;
use crate::runtime::RestRuntime;
use crate::util::now_ms;

pub(crate) type SuccessCb<T> = Box<dyn FnOnce(T) + Send>;
pub(crate) type FailureCb = Box<dyn FnOnce(RestError) + Send>;
type ParseFn<T> = Box<dyn FnOnce(RestResponse) -> Result<T, RestError> + Send>;
type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;
type DispatchFn<T> = Box<dyn FnOnce(RestRuntime, OpContext, SuccessCb<T>, FailureCb) + Send>;

/// Check/deadline/priority state flowing from an operator into the actions
/// it wraps.
pub(crate) struct OpContext {
    check: Option<CheckFn>,
    deadline: i64,
    priority: bool,
}

impl OpContext {
    pub(crate) fn share(&self) -> Self {
        Self {
            check: self.check.clone(),
            deadline: self.deadline,
            priority: self.priority,
        }
    }
}

/// The runtime-default failure callback: benign ends log at debug level,
/// everything else is an error.
pub(crate) fn log_failure(error: &RestError) {
    if error.is_benign() {
        debug!(%error, "request did not complete");
    } else {
        error!(%error, "RestAction queue returned failure");
    }
}

enum Kind<T> {
    /// A concrete API call.
    Request {
        route: CompiledRoute,
        body: Option<RequestBody>,
        headers: Vec<(String, String)>,
        parse: ParseFn<T>,
    },
    /// Terminal already-resolved outcome; ignores checks and deadlines.
    Completed(Result<T, RestError>),
    /// An operator composition.
    Deferred(DispatchFn<T>),
}

/// A lazily-executed, chainable API operation yielding `T`.
///
/// # Example
///
/// ```rust,no_run
/// use restflow::{RestAction, RestRuntime, Route};
///
/// # fn demo(runtime: &RestRuntime) -> Result<(), restflow::RestError> {
/// let route = Route::get("users/{user_id}")?.compile(&["86699011"])?;
/// RestAction::<serde_json::Value>::request_json(runtime, route, None)
///     .map(|user| user["username"].to_string())
///     .queue_then(|name| println!("fetched {name}"));
/// # Ok(())
/// # }
/// ```
pub struct RestAction<T> {
    runtime: RestRuntime,
    check: Option<CheckFn>,
    deadline: i64,
    priority: bool,
    kind: Kind<T>,
}

impl<T: Send + 'static> RestAction<T> {
    /// An action executing `route` and translating the response with `handler`.
    ///
    /// The handler only runs for 2xx responses; everything else is turned
    /// into the matching [`RestError`] before callbacks fire.
    pub fn request(
        runtime: &RestRuntime,
        route: CompiledRoute,
        body: Option<RequestBody>,
        handler: impl FnOnce(RestResponse) -> Result<T, RestError> + Send + 'static,
    ) -> Self {
        Self {
            runtime: runtime.clone(),
            check: None,
            deadline: 0,
            priority: false,
            kind: Kind::Request {
                route,
                body,
                headers: Vec::new(),
                parse: Box::new(handler),
            },
        }
    }

    /// An already-successful action; terminal operations short-circuit.
    pub fn completed(runtime: &RestRuntime, value: T) -> Self {
        Self {
            runtime: runtime.clone(),
            check: None,
            deadline: 0,
            priority: false,
            kind: Kind::Completed(Ok(value)),
        }
    }

    /// An already-failed action; terminal operations short-circuit.
    pub fn error(runtime: &RestRuntime, error: RestError) -> Self {
        Self {
            runtime: runtime.clone(),
            check: None,
            deadline: 0,
            priority: false,
            kind: Kind::Completed(Err(error)),
        }
    }

    /// Set a pre-flight check; a `false` result cancels the request at
    /// dispatch time.
    pub fn set_check(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.check = Some(Arc::new(check));
        self
    }

    /// Set an absolute deadline in epoch milliseconds.
    pub fn deadline(mut self, timestamp_ms: i64) -> Self {
        self.deadline = timestamp_ms;
        self
    }

    /// Set the deadline to now + `timeout` unless one was already set.
    pub fn timeout(self, timeout: Duration) -> Self {
        if self.deadline > 0 {
            self
        } else {
            let deadline = now_ms() + timeout.as_millis() as i64;
            self.deadline(deadline)
        }
    }

    /// Mark the request as priority; it survives
    /// [`cancel_requests`](RestRuntime::cancel_requests).
    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    /// Add a custom request header, e.g. an audit-log reason.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Kind::Request { headers, .. } = &mut self.kind {
            headers.push((name.into(), value.into()));
        }
        self
    }

    /// Dispatch with the runtime default callbacks.
    pub fn queue(self) {
        let failure = self.default_failure();
        let success = self.default_success();
        self.dispatch(success, failure, false);
    }

    /// Dispatch with a success callback and the default failure callback.
    pub fn queue_then(self, on_success: impl FnOnce(T) + Send + 'static) {
        let failure = self.default_failure();
        self.dispatch(Box::new(on_success), failure, false);
    }

    /// Dispatch with explicit success and failure callbacks.
    ///
    /// Callbacks run on the callback pool; each request fires exactly one
    /// of them.
    pub fn queue_with(
        self,
        on_success: impl FnOnce(T) + Send + 'static,
        on_failure: impl FnOnce(RestError) + Send + 'static,
    ) {
        self.dispatch(Box::new(on_success), Box::new(on_failure), false);
    }

    /// Dispatch and return a cancellable future for the result.
    pub fn submit(self) -> RestFuture<T> {
        self.submit_with(false)
    }

    /// Like [`submit`](RestAction::submit), but bypass the scheduler: the
    /// request executes immediately and a 429 resolves the future with
    /// [`RestError::RateLimited`] instead of being retried.
    pub fn submit_direct(self) -> RestFuture<T> {
        self.submit_with(true)
    }

    /// Block until the queued request resolves.
    ///
    /// Fails with [`RestError::InvalidState`] when called from a callback,
    /// where blocking would deadlock the pool. Call this from threads that
    /// may block, never from inside the async runtime.
    pub fn complete(self) -> Result<T, RestError> {
        self.guarded_block(false)
    }

    /// Block like [`complete`](RestAction::complete) but bypass the
    /// scheduler, surfacing 429 as [`RestError::RateLimited`].
    pub fn complete_direct(self) -> Result<T, RestError> {
        self.guarded_block(true)
    }

    fn guarded_block(self, direct: bool) -> Result<T, RestError> {
        if in_callback_context() {
            return Err(RestError::InvalidState(
                "preventing use of complete() in callback threads, this operation can deadlock"
                    .into(),
            ));
        }
        self.submit_with(direct).block()
    }

    fn submit_with(self, direct: bool) -> RestFuture<T> {
        let (sender, receiver) = oneshot::channel();
        let failure_sender = SharedSender::new(sender);
        let success_sender = failure_sender.clone();
        let request = self.dispatch(
            Box::new(move |value| success_sender.send(Ok(value))),
            Box::new(move |error| failure_sender.send(Err(error))),
            direct,
        );
        RestFuture { receiver, request }
    }

    fn default_success(&self) -> SuccessCb<T> {
        let callback = self.runtime.config().default_success.clone();
        Box::new(move |_| callback())
    }

    fn default_failure(&self) -> FailureCb {
        let callback = self.runtime.config().default_failure.clone();
        Box::new(move |error| callback(&error))
    }

    /// Deadline resolution: an explicit deadline wins, otherwise the
    /// configured default timeout applies, otherwise none.
    fn effective_deadline(&self) -> i64 {
        if self.deadline > 0 {
            self.deadline
        } else {
            let default_timeout = self.runtime.config().default_timeout_ms;
            if default_timeout > 0 {
                now_ms() + default_timeout
            } else {
                0
            }
        }
    }

    /// Start the action. Returns the underlying request when one exists so
    /// futures can cancel it.
    pub(crate) fn dispatch(
        self,
        success: SuccessCb<T>,
        failure: FailureCb,
        direct: bool,
    ) -> Option<Arc<RestRequest>> {
        let deadline = self.effective_deadline();
        match self.kind {
            Kind::Completed(result) => {
                match result {
                    Ok(value) => guard_consumer("success", move || success(value)),
                    Err(error) => guard_consumer("failure", move || failure(error)),
                }
                None
            }
            Kind::Request {
                route,
                body,
                headers,
                parse,
            } => {
                let route_name = route.base_route().to_string();
                let consumer = build_consumer(route_name, parse, success, failure);
                let request = Arc::new(RestRequest::new(
                    route,
                    body,
                    headers,
                    deadline,
                    self.priority,
                    direct,
                    self.check.clone(),
                    consumer,
                    self.runtime.callback_pool().clone(),
                ));
                if let Err(error) = self.runtime.request(request.clone()) {
                    request.fail(error);
                }
                Some(request)
            }
            Kind::Deferred(dispatch) => {
                let context = OpContext {
                    check: self.check,
                    deadline,
                    priority: self.priority,
                };
                dispatch(self.runtime, context, success, failure);
                None
            }
        }
    }

    /// Overlay an operator's context onto this action before dispatching it.
    pub(crate) fn apply_context(mut self, context: OpContext) -> Self {
        if let Some(check) = context.check {
            self.check = Some(check);
        }
        if context.deadline > 0 {
            self.deadline = context.deadline;
        }
        if context.priority {
            self.priority = true;
        }
        self
    }

    pub(crate) fn runtime(&self) -> &RestRuntime {
        &self.runtime
    }

    pub(crate) fn deferred(runtime: &RestRuntime, dispatch: DispatchFn<T>) -> Self {
        Self {
            runtime: runtime.clone(),
            check: None,
            deadline: 0,
            priority: false,
            kind: Kind::Deferred(dispatch),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> RestAction<T> {
    /// An action parsing the JSON response body into `T`.
    pub fn request_json(
        runtime: &RestRuntime,
        route: CompiledRoute,
        body: Option<RequestBody>,
    ) -> Self {
        Self::request(runtime, route, body, |response| response.parse())
    }
}

impl RestAction<()> {
    /// An action discarding the response body.
    pub fn request_empty(
        runtime: &RestRuntime,
        route: CompiledRoute,
        body: Option<RequestBody>,
    ) -> Self {
        Self::request(runtime, route, body, |_| Ok(()))
    }
}

/// Translate the raw outcome into the typed result, then run exactly one
/// callback.
fn build_consumer<T: Send + 'static>(
    route_name: String,
    parse: ParseFn<T>,
    success: SuccessCb<T>,
    failure: FailureCb,
) -> Box<dyn FnOnce(Outcome) + Send> {
    Box::new(move |outcome| match outcome {
        Err(error) => guard_consumer("failure", move || failure(error)),
        Ok(response) => {
            if response.is_ok() {
                match parse(response) {
                    Ok(value) => guard_consumer("success", move || success(value)),
                    Err(error) => guard_consumer("failure", move || failure(error)),
                }
            } else if let Some(transport) = response.exception() {
                let error = RestError::Transport(transport.clone());
                guard_consumer("failure", move || failure(error));
            } else if response.is_rate_limit() {
                let error = RestError::RateLimited {
                    route: route_name,
                    retry_after_ms: response.retry_after(),
                };
                guard_consumer("failure", move || failure(error));
            } else {
                let status = response.code().max(0) as u16;
                let error = RestError::Api(ApiError::from_body(status, response.body()));
                guard_consumer("failure", move || failure(error));
            }
        }
    })
}

/// A oneshot sender shared between the success and failure paths; only one
/// of them ever fires.
struct SharedSender<T> {
    sender: Arc<parking_lot::Mutex<Option<oneshot::Sender<Result<T, RestError>>>>>,
}

impl<T> Clone for SharedSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> SharedSender<T> {
    fn new(sender: oneshot::Sender<Result<T, RestError>>) -> Self {
        Self {
            sender: Arc::new(parking_lot::Mutex::new(Some(sender))),
        }
    }

    fn send(&self, outcome: Result<T, RestError>) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(outcome);
        }
    }
}

/// Future resolving to the result of a submitted [`RestAction`].
pub struct RestFuture<T> {
    receiver: oneshot::Receiver<Result<T, RestError>>,
    request: Option<Arc<RestRequest>>,
}

impl<T> RestFuture<T> {
    /// Cancel the underlying request; the future resolves with
    /// [`RestError::Cancelled`].
    pub fn cancel(&self) {
        if let Some(request) = &self.request {
            request.cancel();
        }
    }

    /// Block the current thread until the result arrives.
    pub(crate) fn block(self) -> Result<T, RestError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(RestError::Cancelled))
    }
}

impl<T> Future for RestFuture<T> {
    type Output = Result<T, RestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(RestError::Cancelled),
        })
    }
}
