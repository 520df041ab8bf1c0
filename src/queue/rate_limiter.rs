//! Requeue delay policies for the work queue
//!
//! The default limiter matches the usual controller setup: the larger of a
//! per-key exponential failure backoff and an overall token bucket, so a
//! single broken key backs off on its own while a burst of failures across
//! many keys is still throttled.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Base delay of the per-key exponential failure limiter
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap of the per-key exponential failure limiter
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained requeue rate of the overall token bucket (per second)
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Burst size of the overall token bucket
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Decides how long a failed key waits before it is queued again
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; records the attempt
    fn when(&self, key: &K) -> Duration;

    /// Reset the failure history of `key`
    fn forget(&self, key: &K);

    /// Number of failures recorded for `key` since the last forget
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given base delay and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };

        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key
///
/// Each call takes one token; once the bucket is empty the returned delay
/// is the time until a token would be available at the refill rate.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a bucket that refills at `qps` tokens per second up to `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Composite limiter returning the longest delay of its members
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Combine several limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        // every member records the attempt, so no short-circuit here
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default controller limiter: per-key exponential backoff combined with an
/// overall token bucket
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(
            DEFAULT_BUCKET_QPS,
            DEFAULT_BUCKET_BURST,
        )),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_failure() {
        let limiter = ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let key = "team-a".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.when(&key), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&key), 3);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = "team-a".to_string();

        for _ in 0..40 {
            assert!(limiter.when(&key) <= Duration::from_secs(1));
        }
        assert_eq!(limiter.when(&key), Duration::from_secs(1));
    }

    #[test]
    fn forget_resets_failure_history() {
        let limiter = ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let key = "team-a".to_string();

        limiter.when(&key);
        limiter.when(&key);
        limiter.forget(&key);

        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn keys_back_off_independently() {
        let limiter = ExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        );
        let a = "team-a".to_string();
        let b = "team-b".to_string();

        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = BucketRateLimiter::new(10.0, 2);

        assert_eq!(RateLimiter::<String>::when(&limiter, &"a".into()), Duration::ZERO);
        assert_eq!(RateLimiter::<String>::when(&limiter, &"b".into()), Duration::ZERO);

        let delay = RateLimiter::<String>::when(&limiter, &"c".into());
        assert!(delay > Duration::from_millis(99) && delay < Duration::from_millis(101));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let limiter = BucketRateLimiter::new(10.0, 1);

        assert_eq!(RateLimiter::<String>::when(&limiter, &"a".into()), Duration::ZERO);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(RateLimiter::<String>::when(&limiter, &"a".into()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_uses_the_longer_delay() {
        let limiter = default_controller_rate_limiter::<String>();
        let key = "team-a".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&key), 2);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
    }
}
