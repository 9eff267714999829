//! Rate limiting for the request scheduler.
//!
//! The runtime learns the remote service's advertised limits from response
//! headers and schedules queued requests so they are sent just inside those
//! limits. The default [`BucketRateLimiter`] maps each route family onto a
//! server-assigned bucket (`X-RateLimit-Bucket` hash plus the route's major
//! parameters) and drains each bucket with a serial worker.
//!
//! A replacement limiter can be installed through
//! [`RestConfig::rate_limiter_factory`](crate::config::RestConfig::rate_limiter_factory).

mod bucket;

pub use bucket::BucketRateLimiter;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::RestError;
use crate::http::HttpResponse;
use crate::request::RestRequest;
use crate::requester::Requester;
use crate::route::CompiledRoute;
use crate::util::now_ms;

/// A single wall-clock deadline shared by all buckets.
///
/// While the deadline lies in the future every bucket defers dispatch.
/// Set by 429 responses carrying `X-RateLimit-Global`, or by
/// Cloudflare-origin 429s (no `via` header).
#[derive(Debug, Default)]
pub struct GlobalRateLimit {
    deadline: AtomicI64,
}

impl GlobalRateLimit {
    /// Create an inactive gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current deadline in epoch milliseconds (0 when inactive).
    pub fn get(&self) -> i64 {
        self.deadline.load(Ordering::Acquire)
    }

    /// Replace the deadline.
    pub fn set(&self, deadline_ms: i64) {
        self.deadline.store(deadline_ms, Ordering::Release);
    }

    /// Milliseconds until the gate opens; 0 when it already is open.
    pub fn remaining_ms(&self) -> i64 {
        (self.get() - now_ms()).max(0)
    }
}

/// Everything a rate limiter implementation needs from the runtime.
///
/// Handed to the configured factory when the runtime is built.
pub struct RateLimitContext {
    /// Executes requests popped from bucket queues
    pub requester: Arc<Requester>,
    /// Pool for bucket workers and the cleanup sweep
    pub pool: Handle,
    /// The shared global gate
    pub global: Arc<GlobalRateLimit>,
    /// `true`: interpret `X-RateLimit-Reset-After` (relative seconds);
    /// `false`: interpret `X-RateLimit-Reset` (absolute epoch seconds)
    pub relative_rate_limit: bool,
}

/// Schedules queued requests under the remote service's rate-limit rules.
///
/// All methods that touch limiter state acquire its mutex with a bounded
/// try and fail with [`RestError::InvalidState`] when it cannot be taken.
pub trait RateLimiter: Send + Sync + 'static {
    /// Enqueue a request for its route's bucket and make sure a worker runs.
    ///
    /// Fails with [`RestError::InvalidState`] once the limiter is shut down.
    fn queue(&self, request: Arc<RestRequest>) -> Result<(), RestError>;

    /// Milliseconds until the route may dispatch; 0 when it may go now.
    fn delay_ms(&self, route: &CompiledRoute) -> Result<i64, RestError>;

    /// Update bucket state from a response's headers.
    ///
    /// Returns the bucket's new delay iff the status is 429, else 0.
    fn handle_response(
        &self,
        route: &CompiledRoute,
        response: &HttpResponse,
    ) -> Result<i64, RestError>;

    /// Cancel every queued request that is neither priority nor already
    /// cancelled; returns how many were cancelled.
    fn cancel_all(&self) -> Result<usize, RestError>;

    /// Whether the route currently has a positive delay.
    fn is_rate_limited(&self, route: &CompiledRoute) -> bool {
        self.delay_ms(route).map(|delay| delay > 0).unwrap_or(false)
    }

    /// Stop the cleanup timer, run one final sweep and refuse new work.
    fn shutdown(&self);

    /// Whether [`shutdown`](RateLimiter::shutdown) has been called.
    fn is_shutdown(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_gate_inactive_by_default() {
        let gate = GlobalRateLimit::new();
        assert_eq!(gate.get(), 0);
        assert_eq!(gate.remaining_ms(), 0);
    }

    #[test]
    fn test_global_gate_remaining() {
        let gate = GlobalRateLimit::new();
        gate.set(now_ms() + 5_000);
        let remaining = gate.remaining_ms();
        assert!(remaining > 4_000 && remaining <= 5_000);

        gate.set(now_ms() - 1_000);
        assert_eq!(gate.remaining_ms(), 0);
    }
}
