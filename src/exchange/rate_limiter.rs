//! Token-bucket rate limiting for exchange requests.
//!
//! One bucket per logical endpoint, shared across every caller in the
//! process so concurrent jobs cannot exceed the cap together. Refill and
//! take happen under a single lock acquisition, so accounting is atomic
//! with respect to concurrent acquires. If the backing store errors the
//! limiter fails open: better an occasional 429 from upstream than a
//! stalled pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Default request rate against the exchange betting API.
pub const DEFAULT_RATE: f64 = 5.0;
pub const DEFAULT_BURST: f64 = 10.0;

/// Upper bound on how long a caller blocks waiting for a token.
const MAX_WAIT: Duration = Duration::from_secs(10);

pub enum TakeOutcome {
    Acquired,
    /// No token available; wait roughly this long before retrying.
    Wait(Duration),
}

/// Storage seam for bucket state. The in-memory store below is what runs in
/// production here; the trait keeps the door open for a networked store
/// shared across processes.
pub trait BucketStore: Send + Sync {
    fn take(&self, key: &str, rate: f64, burst: f64, now: Instant) -> anyhow::Result<TakeOutcome>;
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

#[derive(Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl BucketStore for MemoryBucketStore {
    fn take(&self, key: &str, rate: f64, burst: f64, now: Instant) -> anyhow::Result<TakeOutcome> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: burst,
            last_update: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(TakeOutcome::Acquired)
        } else {
            let deficit = 1.0 - bucket.tokens;
            Ok(TakeOutcome::Wait(Duration::from_secs_f64(deficit / rate)))
        }
    }
}

/// Per-endpoint token bucket limiter.
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            store: Arc::new(MemoryBucketStore::default()),
            rate,
            burst,
        }
    }

    pub fn with_store(store: Arc<dyn BucketStore>, rate: f64, burst: f64) -> Self {
        Self { store, rate, burst }
    }

    /// Try to take a token without blocking.
    pub fn try_acquire(&self, endpoint: &str) -> anyhow::Result<TakeOutcome> {
        self.store.take(endpoint, self.rate, self.burst, Instant::now())
    }

    /// Block until a token is available, up to the bounded maximum. On store
    /// failure the request proceeds anyway.
    pub async fn wait_if_needed(&self, endpoint: &str) {
        let deadline = Instant::now() + MAX_WAIT;
        loop {
            match self.try_acquire(endpoint) {
                Ok(TakeOutcome::Acquired) => return,
                Ok(TakeOutcome::Wait(wait)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(endpoint, "rate_limiter_max_wait_exceeded");
                        return;
                    }
                    let sleep_for = wait.min(deadline - now).max(Duration::from_millis(10));
                    debug!(endpoint, wait_ms = sleep_for.as_millis() as u64, "rate_limited");
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    warn!(endpoint, error = %e, "rate_limiter_store_error_failing_open");
                    return;
                }
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn take_n(store: &MemoryBucketStore, key: &str, n: usize, now: Instant) -> usize {
        let mut acquired = 0;
        for _ in 0..n {
            if let Ok(TakeOutcome::Acquired) = store.take(key, 5.0, 10.0, now) {
                acquired += 1;
            }
        }
        acquired
    }

    #[test]
    fn burst_is_honoured_then_exhausted() {
        let store = MemoryBucketStore::default();
        let now = Instant::now();
        assert_eq!(take_n(&store, "listMarketBook", 10, now), 10);
        match store.take("listMarketBook", 5.0, 10.0, now).unwrap() {
            TakeOutcome::Wait(wait) => {
                // One token refills in 1/rate seconds.
                assert!(wait <= Duration::from_secs_f64(0.2001));
            }
            TakeOutcome::Acquired => panic!("bucket should be empty"),
        }
    }

    #[test]
    fn tokens_refill_over_time() {
        let store = MemoryBucketStore::default();
        let now = Instant::now();
        assert_eq!(take_n(&store, "ep", 10, now), 10);
        // After one second at 5/s, five tokens are back.
        let later = now + Duration::from_secs(1);
        assert_eq!(take_n(&store, "ep", 10, later), 5);
    }

    #[test]
    fn buckets_are_independent_per_endpoint() {
        let store = MemoryBucketStore::default();
        let now = Instant::now();
        assert_eq!(take_n(&store, "a", 10, now), 10);
        assert_eq!(take_n(&store, "b", 10, now), 10);
    }

    #[test]
    fn refill_never_exceeds_burst() {
        let store = MemoryBucketStore::default();
        let now = Instant::now();
        assert_eq!(take_n(&store, "ep", 1, now), 1);
        let much_later = now + Duration::from_secs(3600);
        assert_eq!(take_n(&store, "ep", 20, much_later), 10);
    }

    struct FailingStore;

    impl BucketStore for FailingStore {
        fn take(&self, _: &str, _: f64, _: f64, _: Instant) -> anyhow::Result<TakeOutcome> {
            anyhow::bail!("store unreachable")
        }
    }

    #[tokio::test]
    async fn failing_store_fails_open() {
        let limiter = RateLimiter::with_store(Arc::new(FailingStore), 5.0, 10.0);
        // Returns promptly instead of blocking for the max wait.
        let start = Instant::now();
        limiter.wait_if_needed("ep").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
