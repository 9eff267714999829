//! Bucket-based rate limiter.
//!
//! A bucket is determined from path + method + major parameters in two steps:
//!
//! 1. the route (method + template) maps to a hash, learned from the
//!    `X-RateLimit-Bucket` response header;
//! 2. hash + major parameter key forms the bucket id.
//!
//! Until a hash is known a route queues under the synthetic
//! `unlimited+METHOD/template` hash, still scoped by its major parameters,
//! so distinct channels dispatch concurrently while one channel stays
//! sequential. The first response that carries a hash migrates the
//! remaining queue to the real bucket; this happens inside the worker
//! iteration, so a burst of requests against one endpoint moves over in a
//! single step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::RestError;
use crate::http::HttpResponse;
use crate::rate_limit::{GlobalRateLimit, RateLimitContext, RateLimiter};
use crate::request::RestRequest;
use crate::requester::Requester;
use crate::route::{CompiledRoute, Route};
use crate::util::{now_ms, seconds_to_ms};

const HASH_HEADER: &str = "X-RateLimit-Bucket";
const LIMIT_HEADER: &str = "X-RateLimit-Limit";
const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
const RESET_AFTER_HEADER: &str = "X-RateLimit-Reset-After";
const RESET_HEADER: &str = "X-RateLimit-Reset";
const GLOBAL_HEADER: &str = "X-RateLimit-Global";
const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Synthetic hash prefix for routes without a learned bucket.
const UNLIMITED_BUCKET: &str = "unlimited";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_RATE_LIMIT_MS: i64 = 30 * 60 * 1000;

/// The default [`RateLimiter`]: one serial worker per rate-limit bucket.
pub struct BucketRateLimiter {
    me: Weak<BucketRateLimiter>,
    requester: Arc<Requester>,
    pool: Handle,
    global: Arc<GlobalRateLimit>,
    relative_rate_limit: bool,
    state: Mutex<LimiterState>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

struct LimiterState {
    /// Route -> learned hash; kept for the limiter's lifetime, the set of
    /// possible routes bounds its size.
    hashes: HashMap<Route, String>,
    /// Bucket id -> bucket.
    buckets: HashMap<String, Bucket>,
    /// Bucket ids with a live worker task.
    running: HashSet<String>,
    /// Routes that already hit a 429 once; controls log level on repeats.
    hit_rate_limit: HashSet<Route>,
    shutdown: bool,
}

struct Bucket {
    id: String,
    queue: VecDeque<Arc<RestRequest>>,
    reset_at: i64,
    remaining: i64,
    limit: i64,
}

impl Bucket {
    fn new(id: String) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            reset_at: 0,
            remaining: 1,
            limit: 1,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.id.starts_with(UNLIMITED_BUCKET)
    }

    /// Milliseconds until this bucket may dispatch again.
    ///
    /// The global gate dominates. An expired reset refreshes `remaining`
    /// to the limit, since nothing better is known until the next response.
    fn delay_ms(&mut self, global: &GlobalRateLimit) -> i64 {
        let now = now_ms();
        let global_deadline = global.get();
        if global_deadline > now {
            return global_deadline - now;
        }
        if self.reset_at <= now {
            self.remaining = self.limit;
            return 0;
        }
        if self.remaining < 1 {
            self.reset_at - now
        } else {
            0
        }
    }
}

impl BucketRateLimiter {
    /// Create the limiter and start its periodic cleanup sweep.
    pub fn new(context: RateLimitContext) -> Arc<Self> {
        let RateLimitContext {
            requester,
            pool,
            global,
            relative_rate_limit,
        } = context;

        let limiter = Arc::new_cyclic(|me: &Weak<Self>| Self {
            me: me.clone(),
            requester,
            pool,
            global,
            relative_rate_limit,
            state: Mutex::new(LimiterState {
                hashes: HashMap::new(),
                buckets: HashMap::new(),
                running: HashSet::new(),
                hit_rate_limit: HashSet::new(),
                shutdown: false,
            }),
            cleanup_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&limiter);
        let task = limiter.pool.spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            // the first tick fires immediately; the sweep starts one period in
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.run_cleanup();
            }
        });
        *limiter.cleanup_task.lock() = Some(task);

        limiter
    }

    fn locked<T>(&self, f: impl FnOnce(&mut LimiterState) -> T) -> Result<T, RestError> {
        let mut state = self.state.try_lock_for(LOCK_TIMEOUT).ok_or_else(|| {
            RestError::InvalidState(
                "could not acquire rate limiter lock in a reasonable timeframe (10 seconds)".into(),
            )
        })?;
        Ok(f(&mut state))
    }

    fn route_hash(state: &LimiterState, route: &Route) -> String {
        state
            .hashes
            .get(route)
            .cloned()
            .unwrap_or_else(|| format!("{}+{}", UNLIMITED_BUCKET, route))
    }

    fn resolve_bucket_id(state: &LimiterState, route: &CompiledRoute) -> String {
        format!(
            "{}:{}",
            Self::route_hash(state, route.base_route()),
            route.major_param_key()
        )
    }

    /// Get or create the bucket for a route, returning its id.
    fn ensure_bucket(state: &mut LimiterState, route: &CompiledRoute) -> String {
        let id = Self::resolve_bucket_id(state, route);
        state
            .buckets
            .entry(id.clone())
            .or_insert_with(|| Bucket::new(id.clone()));
        id
    }

    /// Schedule a worker for the bucket if none is live. Must run under the
    /// limiter lock.
    fn schedule_locked(&self, state: &mut LimiterState, bucket_id: &str) {
        if state.shutdown {
            return;
        }
        if !state.running.insert(bucket_id.to_string()) {
            return;
        }
        let delay = state
            .buckets
            .get_mut(bucket_id)
            .map(|bucket| bucket.delay_ms(&self.global))
            .unwrap_or(0);

        let Some(this) = self.me.upgrade() else {
            return;
        };
        let id = bucket_id.to_string();
        self.pool.spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            this.run_bucket(id).await;
        });
    }

    async fn run_bucket(self: Arc<Self>, bucket_id: String) {
        enum Step {
            Backoff,
            Skip,
            Execute(Arc<RestRequest>),
        }

        loop {
            let step = self.locked(|state| {
                let Some(bucket) = state.buckets.get_mut(&bucket_id) else {
                    return Step::Backoff;
                };
                if bucket.queue.is_empty() {
                    return Step::Backoff;
                }

                let delay = bucket.delay_ms(&self.global);
                if delay > 0 {
                    let base_route = bucket
                        .queue
                        .front()
                        .map(|request| request.route().base_route().to_string())
                        .unwrap_or_else(|| "N/A".to_string());
                    if self.global.remaining_ms() <= 0 && delay >= LONG_RATE_LIMIT_MS {
                        warn!(
                            minutes = delay / 60_000,
                            route = %base_route,
                            "encountered long rate limit"
                        );
                    }
                    debug!(
                        delay_ms = delay,
                        bucket = %bucket_id,
                        route = %base_route,
                        "backing off bucket"
                    );
                    return Step::Backoff;
                }

                let Some(request) = bucket.queue.pop_front() else {
                    return Step::Backoff;
                };
                if request.is_skipped() {
                    return Step::Skip;
                }

                if bucket.is_unlimited() {
                    // Attempt moving the queue to the real bucket once the
                    // hash has been learned.
                    let real_id = Self::resolve_bucket_id(state, request.route());
                    if real_id != bucket_id {
                        let mut remainder = state
                            .buckets
                            .get_mut(&bucket_id)
                            .map(|bucket| std::mem::take(&mut bucket.queue))
                            .unwrap_or_default();
                        let real = state
                            .buckets
                            .entry(real_id.clone())
                            .or_insert_with(|| Bucket::new(real_id.clone()));
                        // the popped request keeps its slot ahead of the rest
                        real.queue.push_back(request);
                        real.queue.append(&mut remainder);
                        self.schedule_locked(state, &real_id);
                        return Step::Skip;
                    }
                }

                Step::Execute(request)
            });

            let step = match step {
                Ok(step) => step,
                Err(lock_error) => {
                    error!(error = %lock_error, "failed to lock rate limiter state in bucket worker");
                    break;
                }
            };

            match step {
                Step::Backoff => break,
                Step::Skip => continue,
                Step::Execute(request) => {
                    match self.requester.execute(&request, false).await {
                        Ok(0) => {}
                        Ok(_rate_limited) => {
                            // hit a hard rate limit (429), the request keeps
                            // its slot and is retried first
                            let pushed = self.locked(|state| {
                                if let Some(bucket) = state.buckets.get_mut(&bucket_id) {
                                    bucket.queue.push_front(request);
                                }
                            });
                            if pushed.is_err() {
                                break;
                            }
                        }
                        Err(execute_error) => {
                            error!(
                                error = %execute_error,
                                "encountered exception trying to execute request"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.backoff(&bucket_id);
    }

    /// Remove the worker registration and reschedule when work remains.
    fn backoff(&self, bucket_id: &str) {
        let result = self.locked(|state| {
            state.running.remove(bucket_id);
            let has_work = state
                .buckets
                .get(bucket_id)
                .map(|bucket| !bucket.queue.is_empty())
                .unwrap_or(false);
            if has_work {
                self.schedule_locked(state, bucket_id);
            } else if state.shutdown {
                state.buckets.remove(bucket_id);
            }
        });
        if let Err(lock_error) = result {
            error!(error = %lock_error, "failed to lock rate limiter state during backoff");
        }
    }

    /// Apply a response's headers to the route's bucket and return that
    /// bucket's delay.
    fn update_bucket(
        &self,
        state: &mut LimiterState,
        route: &CompiledRoute,
        response: &HttpResponse,
    ) -> i64 {
        let mut bucket_id = Self::ensure_bucket(state, route);

        let global = response.header(GLOBAL_HEADER).is_some();
        let cloudflare = response.header("via").is_none();
        let hash = response.header(HASH_HEADER).map(str::to_string);
        let now = now_ms();

        let base_route = route.base_route().clone();
        if let Some(hash) = &hash {
            if !state.hashes.contains_key(&base_route) {
                state.hashes.insert(base_route.clone(), hash.clone());
                debug!(route = %base_route, hash = %hash, "caching bucket hash");
            }
            // the request may migrate from the unlimited bucket to the real one
            bucket_id = Self::ensure_bucket(state, route);
        }

        if response.status == 429 {
            let retry_after = seconds_to_ms(response.header(RETRY_AFTER_HEADER));
            if global {
                self.global.set(now + retry_after);
                error!(retry_after_ms = retry_after, "encountered global rate limit");
            } else if cloudflare {
                // applies to all routes, not just this bucket
                self.global.set(now + retry_after);
                error!(
                    retry_after_s = retry_after / 1000,
                    "encountered cloudflare rate limit"
                );
            } else {
                let first_hit =
                    state.hit_rate_limit.insert(base_route.clone()) && retry_after < 60_000;
                if let Some(bucket) = state.buckets.get_mut(&bucket_id) {
                    bucket.remaining = 0;
                    bucket.reset_at = now + retry_after;
                }
                // a first hit right after startup is expected while the
                // bucket initializes, keep it quiet unless the delay is long
                if first_hit {
                    debug!(
                        route = %base_route,
                        bucket = %bucket_id,
                        retry_after_ms = retry_after,
                        "encountered 429 on route"
                    );
                } else {
                    warn!(
                        route = %base_route,
                        bucket = %bucket_id,
                        retry_after_ms = retry_after,
                        "encountered 429 on route"
                    );
                }
            }
            return state
                .buckets
                .get_mut(&bucket_id)
                .map(|bucket| bucket.delay_ms(&self.global))
                .unwrap_or(0);
        }

        // without a hash there is not enough information to update anything
        if hash.is_none() {
            return 0;
        }

        if let Some(bucket) = state.buckets.get_mut(&bucket_id) {
            bucket.limit = parse_header_i64(response, LIMIT_HEADER).max(1);
            bucket.remaining = parse_header_i64(response, REMAINING_HEADER);
            bucket.reset_at = if self.relative_rate_limit {
                now + seconds_to_ms(response.header(RESET_AFTER_HEADER))
            } else {
                seconds_to_ms(response.header(RESET_HEADER))
            };
            trace!(
                bucket = %bucket_id,
                remaining = bucket.remaining,
                limit = bucket.limit,
                reset_in_ms = bucket.reset_at - now,
                "updated bucket"
            );
        }
        0
    }

    fn run_cleanup(&self) {
        let result = self.locked(|state| {
            let before = state.buckets.len();
            let now = now_ms();
            let shutting_down = state.shutdown;
            state.buckets.retain(|_, bucket| {
                // drop requests that became skippable while queued
                bucket.queue.retain(|request| !request.is_skipped());
                // a bucket goes when it is empty and holds no valuable
                // information anymore
                !(bucket.queue.is_empty()
                    && (bucket.is_unlimited() || bucket.reset_at <= now || shutting_down))
            });
            before - state.buckets.len()
        });

        match result {
            Ok(removed) if removed > 0 => debug!(removed, "removed expired buckets"),
            Ok(_) => {}
            Err(lock_error) => {
                error!(error = %lock_error, "failed to lock rate limiter state for cleanup")
            }
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn queue(&self, request: Arc<RestRequest>) -> Result<(), RestError> {
        self.locked(|state| {
            if state.shutdown {
                return Err(RestError::InvalidState(
                    "the requester has been stopped, no new requests can be queued".into(),
                ));
            }
            let bucket_id = Self::ensure_bucket(state, request.route());
            if let Some(bucket) = state.buckets.get_mut(&bucket_id) {
                bucket.queue.push_back(request);
            }
            self.schedule_locked(state, &bucket_id);
            Ok(())
        })?
    }

    fn delay_ms(&self, route: &CompiledRoute) -> Result<i64, RestError> {
        self.locked(|state| {
            let bucket_id = Self::resolve_bucket_id(state, route);
            state
                .buckets
                .get_mut(&bucket_id)
                .map(|bucket| bucket.delay_ms(&self.global))
                .unwrap_or(0)
        })
    }

    fn handle_response(
        &self,
        route: &CompiledRoute,
        response: &HttpResponse,
    ) -> Result<i64, RestError> {
        self.locked(|state| {
            let delay = self.update_bucket(state, route, response);
            if response.status == 429 {
                delay
            } else {
                0
            }
        })
    }

    fn cancel_all(&self) -> Result<usize, RestError> {
        let cancelled = self.locked(|state| {
            let mut count = 0;
            for bucket in state.buckets.values() {
                for request in &bucket.queue {
                    if !request.is_priority() && !request.is_cancelled() {
                        request.cancel();
                        count += 1;
                    }
                }
            }
            count
        })?;
        if cancelled > 0 {
            warn!(cancelled, "cancelled queued requests");
        }
        Ok(cancelled)
    }

    fn shutdown(&self) {
        let already_stopped = self
            .locked(|state| std::mem::replace(&mut state.shutdown, true))
            .unwrap_or(true);
        if already_stopped {
            return;
        }

        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.run_cleanup();

        // tell the user about active buckets so the longer shutdown is not
        // a surprise
        let stats = self.locked(|state| {
            let buckets = state.buckets.len();
            let queued: usize = state
                .buckets
                .values()
                .map(|bucket| bucket.queue.len())
                .sum();
            (buckets, queued)
        });
        if let Ok((buckets, queued)) = stats {
            if buckets > 0 {
                let average = queued.div_ceil(buckets);
                info!(
                    buckets,
                    average_queue = average,
                    "waiting for buckets to finish"
                );
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.locked(|state| state.shutdown).unwrap_or(true)
    }
}

impl Drop for BucketRateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
    }
}

fn parse_header_i64(response: &HttpResponse, name: &str) -> i64 {
    response
        .header(name)
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    use super::*;
    use crate::config::RestConfig;

    fn bucket() -> Bucket {
        Bucket::new("abc:111".to_string())
    }

    fn test_limiter(relative: bool) -> Arc<BucketRateLimiter> {
        let config = RestConfig::new("http://localhost:9", "test-agent").unwrap();
        let requester = Arc::new(Requester::new(&config));
        BucketRateLimiter::new(RateLimitContext {
            requester,
            pool: Handle::current(),
            global: Arc::new(GlobalRateLimit::new()),
            relative_rate_limit: relative,
        })
    }

    fn response_with(status: u16, headers: &[(&str, &str)]) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        HttpResponse {
            status,
            message: "test".into(),
            headers: map,
            body: Vec::new(),
        }
    }

    fn compiled(channel_id: &str) -> CompiledRoute {
        Route::get("channels/{channel_id}/messages")
            .unwrap()
            .compile(&[channel_id])
            .unwrap()
    }

    #[tokio::test]
    async fn test_handle_response_learns_hash_and_updates_bucket() {
        let limiter = test_limiter(true);
        let route = compiled("111");
        let response = response_with(
            200,
            &[
                ("x-ratelimit-bucket", "abc"),
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "4"),
                ("x-ratelimit-reset-after", "1.000"),
                ("via", "1.1 gateway"),
            ],
        );

        assert_eq!(limiter.handle_response(&route, &response).unwrap(), 0);

        let state = limiter.state.lock();
        assert_eq!(
            state.hashes.get(route.base_route()),
            Some(&"abc".to_string())
        );
        let bucket = state.buckets.get("abc:111").unwrap();
        assert_eq!(bucket.limit, 5);
        assert_eq!(bucket.remaining, 4);
        let reset_in = bucket.reset_at - now_ms();
        assert!(reset_in > 500 && reset_in <= 1_000);
    }

    #[tokio::test]
    async fn test_absolute_reset_mode_reads_reset_header() {
        let limiter = test_limiter(false);
        let route = compiled("111");
        let reset_at = (now_ms() + 2_000) as f64 / 1000.0;
        let response = response_with(
            200,
            &[
                ("x-ratelimit-bucket", "abc"),
                ("x-ratelimit-limit", "5"),
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset", &format!("{:.3}", reset_at)),
                ("via", "1.1 gateway"),
            ],
        );

        limiter.handle_response(&route, &response).unwrap();

        let delay = limiter.delay_ms(&route).unwrap();
        assert!(delay > 1_000 && delay <= 2_000);
    }

    #[tokio::test]
    async fn test_per_route_429_exhausts_only_its_bucket() {
        let limiter = test_limiter(true);
        let route = compiled("111");
        let response = response_with(
            429,
            &[("retry-after", "2"), ("via", "1.1 gateway")],
        );

        let delay = limiter.handle_response(&route, &response).unwrap();
        assert!(delay > 1_500 && delay <= 2_000);
        // the gate stays open for everyone else
        assert_eq!(limiter.global.remaining_ms(), 0);
    }

    #[tokio::test]
    async fn test_cloudflare_429_sets_the_global_gate() {
        let limiter = test_limiter(true);
        let route = compiled("111");
        // no via header: the response never passed through the API gateway
        let response = response_with(429, &[("retry-after", "3")]);

        limiter.handle_response(&route, &response).unwrap();
        assert!(limiter.global.remaining_ms() > 2_000);
    }

    #[tokio::test]
    async fn test_cleanup_preserves_hot_buckets() {
        let limiter = test_limiter(true);
        {
            let mut state = limiter.state.lock();
            let mut hot = Bucket::new("abc:1".into());
            hot.reset_at = now_ms() + 30_000;
            hot.remaining = 0;
            state.buckets.insert(hot.id.clone(), hot);

            let mut expired = Bucket::new("def:2".into());
            expired.reset_at = now_ms() - 1;
            state.buckets.insert(expired.id.clone(), expired);

            let unlimited = Bucket::new("unlimited+GET/gateway:N/A".into());
            state.buckets.insert(unlimited.id.clone(), unlimited);
        }

        limiter.run_cleanup();

        let state = limiter.state.lock();
        assert!(state.buckets.contains_key("abc:1"));
        assert!(!state.buckets.contains_key("def:2"));
        assert!(!state.buckets.contains_key("unlimited+GET/gateway:N/A"));
    }

    #[tokio::test]
    async fn test_queue_rejected_after_shutdown() {
        let limiter = test_limiter(true);
        limiter.shutdown();
        assert!(limiter.is_shutdown());

        let route = compiled("111");
        let request = Arc::new(crate::request::RestRequest::new(
            route,
            None,
            Vec::new(),
            0,
            false,
            false,
            None,
            Box::new(|_| {}),
            Handle::current(),
        ));
        assert!(matches!(
            limiter.queue(request),
            Err(RestError::InvalidState(_))
        ));
    }

    #[test]
    fn test_fresh_bucket_has_no_delay() {
        let global = GlobalRateLimit::new();
        assert_eq!(bucket().delay_ms(&global), 0);
    }

    #[test]
    fn test_exhausted_bucket_waits_for_reset() {
        let global = GlobalRateLimit::new();
        let mut bucket = bucket();
        bucket.limit = 5;
        bucket.remaining = 0;
        bucket.reset_at = now_ms() + 2_000;

        let delay = bucket.delay_ms(&global);
        assert!(delay > 1_500 && delay <= 2_000);
    }

    #[test]
    fn test_expired_reset_refreshes_remaining() {
        let global = GlobalRateLimit::new();
        let mut bucket = bucket();
        bucket.limit = 5;
        bucket.remaining = 0;
        bucket.reset_at = now_ms() - 1;

        assert_eq!(bucket.delay_ms(&global), 0);
        assert_eq!(bucket.remaining, 5);
    }

    #[test]
    fn test_global_gate_dominates_bucket_delay() {
        let global = GlobalRateLimit::new();
        global.set(now_ms() + 5_000);

        let mut bucket = bucket();
        bucket.remaining = 3;

        let delay = bucket.delay_ms(&global);
        assert!(delay > 4_000, "global gate must defer every bucket");
    }

    #[test]
    fn test_unlimited_detection() {
        assert!(Bucket::new("unlimited+GET/gateway:N/A".into()).is_unlimited());
        assert!(!Bucket::new("abc123:42".into()).is_unlimited());
    }
}
