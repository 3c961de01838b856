//! Token bucket in front of the alert sink.
//!
//! Alerts are fire-and-forget, so the limiter only has to answer one
//! question synchronously: is a token available right now. There is no
//! queueing and no waiting; a denied post is simply dropped.

use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with fractional refill.
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Build a limiter that refills `rate_per_second` tokens up to a
    /// `burst` cap. The bucket starts full.
    #[must_use]
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            rate_per_second,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self
            .bucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(10.0, 8.0);
        for _ in 0..8 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(1000.0, 2.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let limiter = RateLimiter::new(1000.0, 1.0);
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(limiter.try_acquire());
        // Refill is capped at the burst, so a second immediate take
        // fails no matter how long the limiter sat idle.
        assert!(!limiter.try_acquire());
    }
}
