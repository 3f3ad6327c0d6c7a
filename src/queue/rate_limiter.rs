//! Rate limiters deciding how long a re-added key waits
//!
//! The reconciler never sleeps on a failure itself. It hands the key back to
//! the queue through [`RateLimitingQueue::add_rate_limited`], and the queue
//! asks a [`RateLimiter`] how long the key must wait before it is eligible
//! again.
//!
//! [`RateLimitingQueue::add_rate_limited`]: super::RateLimitingQueue::add_rate_limited

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides the delay for an item that is being re-queued
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be processed again; records one more failure
    fn when(&self, item: &T) -> Duration;

    /// Clear any failure history kept for `item`
    fn forget(&self, item: &T);

    /// Number of failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> u32;
}

/// Configuration for per-item exponential backoff
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
        }
    }
}

/// Per-item exponential backoff: `initial * multiplier^failures`, capped
pub struct ItemExponentialBackoff<T> {
    config: BackoffConfig,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialBackoff<T> {
    /// Create a limiter with the given backoff curve
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for ItemExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        let max = self.config.max_delay.as_nanos() as f64;
        let delay = self.config.initial_delay.as_nanos() as f64
            * self.config.backoff_multiplier.powi(exp.min(i32::MAX as u32) as i32);
        if !delay.is_finite() || delay > max {
            return self.config.max_delay;
        }
        Duration::from_nanos(delay.round() as u64)
    }

    fn forget(&self, item: &T) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

/// Overall token bucket shared by all items
///
/// Each call reserves one token. When the bucket is empty the reservation
/// is still granted, but in the future, so bursts of failures are spread
/// out at `qps`.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    /// Create a full bucket refilled at `qps`, holding at most `burst` tokens
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for TokenBucket {
    fn when(&self, _item: &T) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((-state.tokens / self.qps * 1e9).round() as u64)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay any of them asks for
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    /// Combine the given limiters
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The usual controller limiter: per-item exponential backoff bounded below
/// by an overall token bucket
pub fn default_controller_rate_limiter<T>(
    backoff: BackoffConfig,
    qps: f64,
    burst: u32,
) -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOf::new(vec![
        Box::new(ItemExponentialBackoff::new(backoff)),
        Box::new(TokenBucket::new(qps, burst)),
    ])
}
