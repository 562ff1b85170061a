use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::warn;

use golive_core::ratelimit::{Decision, RateLimiter, GLOBAL_KEY};
use golive_util::RateLimitConfig;

use crate::problem::ProblemResponse;

/// The three ingress limiters described in the service's admission policy.
///
/// All three reject immediately rather than queueing; a rejected caller gets
/// a `Retry-After` hint and may come back later.
pub struct IngressLimits {
    webhook: RateLimiter,
    caller: RateLimiter,
    global: RateLimiter,
}

impl IngressLimits {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            webhook: RateLimiter::per_second(config.webhook_per_sec),
            caller: RateLimiter::per_minute(config.caller_per_min),
            global: RateLimiter::per_second(config.global_per_sec),
        }
    }

    /// Admission check for the webhook path (global + webhook buckets).
    pub fn check_webhook(&self, now: DateTime<Utc>) -> Result<(), ProblemResponse> {
        reject_if_limited(self.global.allow(GLOBAL_KEY, now), "global")?;
        reject_if_limited(self.webhook.allow("webhook", now), "webhook")
    }

    /// Admission check for API routes (global + per-caller buckets).
    pub fn check_api(&self, caller_key: &str, now: DateTime<Utc>) -> Result<(), ProblemResponse> {
        reject_if_limited(self.global.allow(GLOBAL_KEY, now), "global")?;
        reject_if_limited(self.caller.allow(caller_key, now), "caller")
    }

    /// Drops idle buckets across all three limiters, returning the count.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        self.webhook.evict_idle(now) + self.caller.evict_idle(now) + self.global.evict_idle(now)
    }
}

fn reject_if_limited(decision: Decision, limiter: &'static str) -> Result<(), ProblemResponse> {
    match decision {
        Decision::Allowed => Ok(()),
        Decision::Limited { retry_after_secs } => {
            counter!("ratelimit_rejected_total", "limiter" => limiter).increment(1);
            warn!(
                stage = "ingress",
                limiter, retry_after_secs, "request rejected by rate limiter"
            );
            Err(ProblemResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("rate limited by the {limiter} limiter"),
            )
            .with_retry_after(retry_after_secs))
        }
    }
}

/// Resolves the caller identity used to key the per-caller limiter.
///
/// Behind the reverse proxy the first `X-Forwarded-For` entry is the
/// network origin; direct connections collapse to a single key.
pub fn caller_key(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| "direct".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn limits(caller_per_min: u32) -> IngressLimits {
        IngressLimits::new(RateLimitConfig {
            webhook_per_sec: 2,
            caller_per_min,
            global_per_sec: 1000,
        })
    }

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("timestamp")
    }

    #[test]
    fn webhook_bucket_rejects_past_capacity() {
        let limits = limits(50);
        let now = at("2024-05-01T18:00:00Z");

        assert!(limits.check_webhook(now).is_ok());
        assert!(limits.check_webhook(now).is_ok());
        assert!(limits.check_webhook(now).is_err());
    }

    #[test]
    fn caller_buckets_are_keyed_independently() {
        let limits = limits(1);
        let now = at("2024-05-01T18:00:00Z");

        assert!(limits.check_api("10.0.0.1", now).is_ok());
        assert!(limits.check_api("10.0.0.1", now).is_err());
        assert!(limits.check_api("10.0.0.2", now).is_ok());
    }

    #[test]
    fn caller_key_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_key(&headers), "direct");

        headers.insert(
            "X-Forwarded-For",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(caller_key(&headers), "203.0.113.9");
    }
}
