use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Key used when a limiter guards aggregate load rather than one caller.
pub const GLOBAL_KEY: &str = "global";

/// Non-blocking token-bucket limiter keyed by caller identity.
///
/// A bucket starts full, drains one token per request, and refills
/// continuously at the configured rate. Rejection never blocks; the caller
/// receives a retry hint instead. Buckets idle past the eviction window are
/// dropped by the maintenance sweep to bound memory under high key
/// cardinality.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    idle_window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_seen: DateTime<Utc>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Limited {
        /// Whole seconds until a token becomes available.
        retry_after_secs: u64,
    },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_per_sec: refill_per_sec.max(f64::EPSILON),
            idle_window: Duration::minutes(10),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter sustaining `rate` requests per second with equal burst.
    pub fn per_second(rate: u32) -> Self {
        Self::new(rate, f64::from(rate.max(1)))
    }

    /// Limiter sustaining `rate` requests per minute with equal burst.
    pub fn per_minute(rate: u32) -> Self {
        Self::new(rate, f64::from(rate.max(1)) / 60.0)
    }

    /// Admits or rejects one request for the given key.
    pub fn allow(&self, key: &str, now: DateTime<Utc>) -> Decision {
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_seen: now,
        });

        let elapsed = now
            .signed_duration_since(bucket.last_seen)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            Decision::Limited {
                retry_after_secs: (deficit / self.refill_per_sec).ceil().max(1.0) as u64,
            }
        }
    }

    /// Drops buckets not seen within the idle window, returning the count.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.idle_window;
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.last_seen > cutoff);
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().expect("rate limiter poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    #[test]
    fn rejects_request_past_capacity() {
        let limiter = RateLimiter::per_minute(3);
        let now = at("2024-05-01T18:00:00Z");

        for _ in 0..3 {
            assert!(limiter.allow("caller-a", now).is_allowed());
        }
        match limiter.allow("caller-a", now) {
            Decision::Limited { retry_after_secs } => assert!(retry_after_secs >= 1),
            Decision::Allowed => panic!("fourth request should be limited"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::per_minute(1);
        let now = at("2024-05-01T18:00:00Z");

        assert!(limiter.allow("caller-a", now).is_allowed());
        assert!(!limiter.allow("caller-a", now).is_allowed());
        assert!(limiter.allow("caller-b", now).is_allowed());
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::per_second(2);
        let now = at("2024-05-01T18:00:00Z");

        assert!(limiter.allow(GLOBAL_KEY, now).is_allowed());
        assert!(limiter.allow(GLOBAL_KEY, now).is_allowed());
        assert!(!limiter.allow(GLOBAL_KEY, now).is_allowed());

        let later = now + Duration::seconds(1);
        assert!(limiter.allow(GLOBAL_KEY, later).is_allowed());
    }

    #[test]
    fn retry_hint_covers_the_deficit() {
        let limiter = RateLimiter::per_minute(1);
        let now = at("2024-05-01T18:00:00Z");

        assert!(limiter.allow("caller-a", now).is_allowed());
        match limiter.allow("caller-a", now) {
            Decision::Limited { retry_after_secs } => {
                // One token per minute, so the hint is the full refill.
                assert_eq!(retry_after_secs, 60);
            }
            Decision::Allowed => panic!("should be limited"),
        }
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let limiter = RateLimiter::per_second(10);
        let now = at("2024-05-01T18:00:00Z");

        limiter.allow("caller-a", now);
        limiter.allow("caller-b", now + Duration::minutes(5));
        assert_eq!(limiter.tracked_keys(), 2);

        let evicted = limiter.evict_idle(now + Duration::minutes(11));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
