//! Transformations over [`RestAction`].
//!
//! Operators never dispatch anything themselves; they wrap the receiver in
//! a new lazy action. Checks, deadlines and the priority flag set on the
//! outer action flow into every inner action at dispatch time.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{select, Either};

use crate::error::RestError;
use crate::request::in_callback_scope;

use super::RestAction;

impl<T: Send + 'static> RestAction<T> {
    /// Transform the success value.
    pub fn map<U, F>(self, f: F) -> RestAction<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |_runtime, context, success, failure| {
                self.apply_context(context).dispatch(
                    Box::new(move |value| success(f(value))),
                    failure,
                    false,
                );
            }),
        )
    }

    /// Chain a subsequent call produced from the success value.
    ///
    /// The chained action inherits this action's check, deadline and
    /// priority flag.
    pub fn flat_map<U, F>(self, f: F) -> RestAction<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> RestAction<U> + Send + 'static,
    {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |_runtime, context, success, failure| {
                let child_context = context.share();
                let (parent_failure, child_failure) = split_cb(failure);
                self.apply_context(context).dispatch(
                    Box::new(move |value| {
                        f(value)
                            .apply_context(child_context)
                            .dispatch(success, child_failure, false);
                    }),
                    parent_failure,
                    false,
                );
            }),
        )
    }

    /// Wait on the rate-limit scheduler pool before dispatching.
    pub fn delay(self, duration: Duration) -> RestAction<T> {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |runtime, context, success, failure| {
                runtime.rate_limit_pool().clone().spawn(async move {
                    tokio::time::sleep(duration).await;
                    self.apply_context(context).dispatch(success, failure, false);
                });
            }),
        )
    }

    /// Run both actions concurrently; the result completes when both do.
    ///
    /// The first failure cancels the other action and fails the pair.
    pub fn zip<U>(self, other: RestAction<U>) -> RestAction<(T, U)>
    where
        U: Send + 'static,
    {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |runtime, context, success, failure| {
                let left = self.apply_context(context.share()).submit();
                let right = other.apply_context(context).submit();
                runtime
                    .callback_pool()
                    .clone()
                    .spawn(in_callback_scope(async move {
                        match select(left, right).await {
                            Either::Left((Ok(a), right)) => match right.await {
                                Ok(b) => success((a, b)),
                                Err(error) => failure(error),
                            },
                            Either::Left((Err(error), right)) => {
                                right.cancel();
                                failure(error);
                            }
                            Either::Right((Ok(b), left)) => match left.await {
                                Ok(a) => success((a, b)),
                                Err(error) => failure(error),
                            },
                            Either::Right((Err(error), left)) => {
                                left.cancel();
                                failure(error);
                            }
                        }
                    }));
            }),
        )
    }

    /// Run both actions concurrently, discarding their values.
    pub fn and<U>(self, other: RestAction<U>) -> RestAction<()>
    where
        U: Send + 'static,
    {
        self.zip(other).map(|_| ())
    }

    /// Substitute a recovery value when a failure matches the condition.
    pub fn on_error_map<C, R>(self, condition: C, recover: R) -> RestAction<T>
    where
        C: Fn(&RestError) -> bool + Send + 'static,
        R: FnOnce(RestError) -> T + Send + 'static,
    {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |_runtime, context, success, failure| {
                let (success, recovered) = split_cb(success);
                self.apply_context(context).dispatch(
                    success,
                    Box::new(move |error| {
                        if condition(&error) {
                            recovered(recover(error));
                        } else {
                            failure(error);
                        }
                    }),
                    false,
                );
            }),
        )
    }

    /// Substitute a recovery action when a failure matches the condition.
    pub fn on_error_flat_map<C, R>(self, condition: C, recover: R) -> RestAction<T>
    where
        C: Fn(&RestError) -> bool + Send + 'static,
        R: FnOnce(RestError) -> RestAction<T> + Send + 'static,
    {
        let runtime = self.runtime().clone();
        RestAction::deferred(
            &runtime,
            Box::new(move |_runtime, context, success, failure| {
                let child_context = context.share();
                let (success, recovered) = split_cb(success);
                let (parent_failure, child_failure) = split_cb(failure);
                self.apply_context(context).dispatch(
                    success,
                    Box::new(move |error| {
                        if condition(&error) {
                            recover(error)
                                .apply_context(child_context)
                                .dispatch(recovered, child_failure, false);
                        } else {
                            parent_failure(error);
                        }
                    }),
                    false,
                );
            }),
        )
    }
}

/// Split a one-shot callback into two handles; whichever fires first wins.
///
/// Safe because every dispatch path fires at most one callback in total.
fn split_cb<A: Send + 'static>(
    callback: Box<dyn FnOnce(A) + Send>,
) -> (Box<dyn FnOnce(A) + Send>, Box<dyn FnOnce(A) + Send>) {
    let slot = Arc::new(parking_lot::Mutex::new(Some(callback)));
    let first = {
        let slot = slot.clone();
        Box::new(move |value: A| {
            if let Some(callback) = slot.lock().take() {
                callback(value);
            }
        })
    };
    let second = Box::new(move |value: A| {
        if let Some(callback) = slot.lock().take() {
            callback(value);
        }
    });
    (first, second)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::RestConfig;
    use crate::error::ApiError;
    use crate::route::Route;
    use crate::runtime::RestRuntime;

    fn runtime() -> RestRuntime {
        RestRuntime::new(RestConfig::new("http://localhost:9", "test-agent").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_map_transforms_value() {
        let runtime = runtime();
        let value = RestAction::completed(&runtime, 21)
            .map(|v| v * 2)
            .submit()
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_map_propagates_failure() {
        let runtime = runtime();
        let result = RestAction::<u32>::error(&runtime, RestError::Timeout)
            .map(|v| v * 2)
            .submit()
            .await;
        assert!(matches!(result, Err(RestError::Timeout)));
    }

    #[tokio::test]
    async fn test_flat_map_chains() {
        let runtime = runtime();
        let rt = runtime.clone();
        let value = RestAction::completed(&runtime, 5)
            .flat_map(move |v| RestAction::completed(&rt, v + 1))
            .submit()
            .await
            .unwrap();
        assert_eq!(value, 6);
    }

    #[tokio::test]
    async fn test_flat_map_propagates_check_to_chained_request() {
        let runtime = runtime();
        let rt = runtime.clone();
        let route = Route::get("gateway").unwrap().compile(&[]).unwrap();
        let result = RestAction::completed(&runtime, ())
            .flat_map(move |_| RestAction::<()>::request_empty(&rt, route, None))
            .set_check(|| false)
            .submit()
            .await;
        assert!(matches!(result, Err(RestError::Cancelled)));
    }

    #[tokio::test]
    async fn test_zip_combines_results() {
        let runtime = runtime();
        let left = RestAction::completed(&runtime, 1);
        let right = RestAction::completed(&runtime, "two");
        let (a, b) = left.zip(right).submit().await.unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, "two");
    }

    #[tokio::test]
    async fn test_zip_fails_when_either_fails() {
        let runtime = runtime();
        let left = RestAction::<u32>::error(&runtime, RestError::Timeout);
        let right = RestAction::completed(&runtime, 2u32);
        let result = left.zip(right).submit().await;
        assert!(matches!(result, Err(RestError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_defers_dispatch() {
        let runtime = runtime();
        let start = Instant::now();
        let value = RestAction::completed(&runtime, 9)
            .delay(Duration::from_secs(2))
            .submit()
            .await
            .unwrap();
        assert_eq!(value, 9);
        // paused clock: the sleep is auto-advanced, not actually waited out
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_on_error_map_recovers_matching_failure() {
        let runtime = runtime();
        let value = RestAction::<u32>::error(
            &runtime,
            RestError::Api(ApiError::new(404, 10008, "Unknown Message")),
        )
        .on_error_map(
            |error| error.api_code() == Some(10008),
            |_| 0,
        )
        .submit()
        .await
        .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_on_error_map_passes_through_non_matching() {
        let runtime = runtime();
        let result = RestAction::<u32>::error(&runtime, RestError::Timeout)
            .on_error_map(|error| error.api_code() == Some(10008), |_| 0)
            .submit()
            .await;
        assert!(matches!(result, Err(RestError::Timeout)));
    }

    #[tokio::test]
    async fn test_on_error_flat_map_recovers_with_action() {
        let runtime = runtime();
        let rt = runtime.clone();
        let value = RestAction::<u32>::error(&runtime, RestError::Timeout)
            .on_error_flat_map(
                |error| matches!(error, RestError::Timeout),
                move |_| RestAction::completed(&rt, 99),
            )
            .submit()
            .await
            .unwrap();
        assert_eq!(value, 99);
    }

    #[tokio::test]
    async fn test_and_discards_values() {
        let runtime = runtime();
        let left = RestAction::completed(&runtime, 1);
        let right = RestAction::completed(&runtime, 2);
        left.and(right).submit().await.unwrap();
    }
}
