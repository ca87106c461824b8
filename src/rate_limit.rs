use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::crd::PodWorkItem;

/// Composable rate-limiter interface: "how long should this item wait
/// before its next attempt". Two concrete limiters (`TokenBucket`,
/// `ExponentialBackoff`) and a combinator (`MaxOf`) implement it, so the
/// update worker's success and failure paths can share the same shape.
pub trait RateLimiter<T> {
    /// Delay before `item` should next be processed. Calling this also
    /// advances any per-item failure bookkeeping the limiter keeps.
    fn when(&self, item: &T) -> Duration;
    /// Clears any failure bookkeeping kept for `item`.
    fn forget(&self, item: &T);
    /// Number of times `when` has been called for `item` since the last
    /// `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

/* ============================= TOKEN BUCKET ============================= */

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A classic token bucket: `limit` tokens refill per second up to
/// `burst` capacity. Shared across every item (it has no per-item
/// state), used both as the per-worker rate and the cluster-wide speed
/// limit.
pub struct TokenBucket {
    limit: Mutex<f64>,
    burst: Mutex<f64>,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(limit_per_sec: f64, burst: f64) -> Self {
        Self {
            limit: Mutex::new(limit_per_sec),
            burst: Mutex::new(burst),
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Adjusts the per-worker bucket at runtime (the reconciler
    /// recomputes this as eligible-pod counts change).
    pub fn set_rate(&self, limit_per_sec: f64, burst: f64) {
        *self.limit.lock().expect("token bucket limit mutex poisoned") = limit_per_sec;
        *self.burst.lock().expect("token bucket burst mutex poisoned") = burst;
    }

    fn refill(&self, state: &mut BucketState) {
        let limit = *self.limit.lock().expect("token bucket limit mutex poisoned");
        let burst = *self.burst.lock().expect("token bucket burst mutex poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * limit).min(burst);
        state.last_refill = now;
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut state = self.state.lock().expect("token bucket state mutex poisoned");
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Duration::ZERO;
        }

        let limit = *self.limit.lock().expect("token bucket limit mutex poisoned");
        if limit <= 0.0 {
            return Duration::from_secs(1);
        }
        let deficit = 1.0 - state.tokens;
        state.tokens = 0.0;
        Duration::from_secs_f64(deficit / limit)
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/* ============================= EXPONENTIAL BACKOFF ============================= */

/// Full-jitter exponential backoff applied only to items re-enqueued
/// after a failure: `sleep ∈ [0, min(cap, base · 2^attempt)]`. Same
/// shape as the `backoff_full_jitter` helper used elsewhere for
/// cancellation-aware retry loops, adapted here to a per-item requeue
/// counter instead of a fixed retry loop.
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    attempts: Mutex<HashMap<(String, String), u32>>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempts: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter<PodWorkItem> for ExponentialBackoff {
    fn when(&self, item: &PodWorkItem) -> Duration {
        let mut attempts = self.attempts.lock().expect("backoff attempts mutex poisoned");
        let attempt = attempts.entry(item.key()).or_insert(0);
        let delay = backoff_full_jitter(self.base, self.cap, *attempt as usize);
        *attempt += 1;
        delay
    }

    fn forget(&self, item: &PodWorkItem) {
        self.attempts
            .lock()
            .expect("backoff attempts mutex poisoned")
            .remove(&item.key());
    }

    fn num_requeues(&self, item: &PodWorkItem) -> u32 {
        self.attempts
            .lock()
            .expect("backoff attempts mutex poisoned")
            .get(&item.key())
            .copied()
            .unwrap_or(0)
    }
}

/// Exponential term `base * 2^attempt`, capped, with a uniform random
/// jitter in `[0, upper]`. Millis math avoids `Duration` overflow.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 { u64::MAX } else { 1u64 << attempt };
    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/* ============================= MAX-OF COMBINATOR ============================= */

/// Composes two rate limiters that must share a floor: the effective
/// delay is the *more conservative* (longer) of the two, never the
/// shorter. Used to combine the per-worker token bucket with the
/// cluster-wide speed limit (the cluster cap is a ceiling the per-worker
/// rate can never exceed), and to combine the success-path limiter with
/// the failure backoff on the `addFailed` path.
pub struct MaxOf<A, B, T> {
    a: A,
    b: B,
    _marker: PhantomData<T>,
}

impl<A, B, T> MaxOf<A, B, T>
where
    A: RateLimiter<T>,
    B: RateLimiter<T>,
{
    pub fn new(a: A, b: B) -> Self {
        Self {
            a,
            b,
            _marker: PhantomData,
        }
    }
}

impl<A, B, T> RateLimiter<T> for MaxOf<A, B, T>
where
    A: RateLimiter<T>,
    B: RateLimiter<T>,
{
    fn when(&self, item: &T) -> Duration {
        self.a.when(item).max(self.b.when(item))
    }

    fn forget(&self, item: &T) {
        self.a.forget(item);
        self.b.forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.a.num_requeues(item).max(self.b.num_requeues(item))
    }
}

/// Lets an `Arc<impl RateLimiter<T>>` be composed directly in a `MaxOf`,
/// so a limiter shared across workers (e.g. the cluster-wide speed
/// limit) doesn't need to be cloned or re-wrapped per worker.
impl<T, R: RateLimiter<T> + ?Sized> RateLimiter<T> for Arc<R> {
    fn when(&self, item: &T) -> Duration {
        self.as_ref().when(item)
    }
    fn forget(&self, item: &T) {
        self.as_ref().forget(item)
    }
    fn num_requeues(&self, item: &T) -> u32 {
        self.as_ref().num_requeues(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_allows_burst_then_throttles() {
        let bucket = TokenBucket::new(1.0, 2.0);
        let item = PodWorkItem::new("ns", "pod-1", "1.11");
        assert_eq!(bucket.when(&item), Duration::ZERO);
        assert_eq!(bucket.when(&item), Duration::ZERO);
        // third immediate call should have to wait
        assert!(bucket.when(&item) > Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_increases_with_attempts() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));
        let item = PodWorkItem::new("ns", "pod-1", "1.11");
        assert_eq!(backoff.num_requeues(&item), 0);
        let _ = backoff.when(&item);
        assert_eq!(backoff.num_requeues(&item), 1);
        let _ = backoff.when(&item);
        assert_eq!(backoff.num_requeues(&item), 2);
    }

    #[test]
    fn test_exponential_backoff_forget_resets() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));
        let item = PodWorkItem::new("ns", "pod-1", "1.11");
        let _ = backoff.when(&item);
        backoff.forget(&item);
        assert_eq!(backoff.num_requeues(&item), 0);
    }

    #[test]
    fn test_backoff_full_jitter_bounds() {
        for attempt in 0..10 {
            let d = backoff_full_jitter(Duration::from_millis(250), Duration::from_secs(10), attempt);
            assert!(d <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_max_of_picks_longer_delay() {
        let fast = TokenBucket::new(1_000_000.0, 1_000_000.0);
        let slow = ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60));
        let combo = MaxOf::new(fast, slow);
        let item = PodWorkItem::new("ns", "pod-1", "1.11");
        // fast bucket never waits; slow backoff waits at least some amount > 0
        let delay = combo.when(&item);
        assert!(delay > Duration::ZERO);
    }
}
