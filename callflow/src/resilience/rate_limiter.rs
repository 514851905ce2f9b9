//! Sliding-bucket request throttle.
//!
//! Requests are counted in one-second and one-minute buckets measured from the
//! limiter's creation. A request is admitted only while both the current
//! second and the current minute are below their ceilings; otherwise the
//! caller sleeps until the next bucket boundary and tries again. There is no
//! upper bound on the total wait.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Number of past buckets retained per window.
const RETAINED_BUCKETS: u64 = 5;

const SECOND_MS: u64 = 1000;
const MINUTE_MS: u64 = 60_000;

/// Rate limit configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Ceiling per one-second bucket (`None` = unlimited).
    #[serde(default)]
    pub max_requests_per_second: Option<u32>,
    /// Ceiling per one-minute bucket (`None` = unlimited).
    #[serde(default)]
    pub max_requests_per_minute: Option<u32>,
    /// Prefix prepended to the endpoint to form the limiter key.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl RateLimitConfig {
    /// Creates an unlimited configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-second ceiling.
    #[must_use]
    pub fn per_second(mut self, max: u32) -> Self {
        self.max_requests_per_second = Some(max);
        self
    }

    /// Sets the per-minute ceiling.
    #[must_use]
    pub fn per_minute(mut self, max: u32) -> Self {
        self.max_requests_per_minute = Some(max);
        self
    }

    /// Sets the key prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Builds the limiter key for an endpoint.
    #[must_use]
    pub fn key_for(&self, endpoint: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}{endpoint}"),
            None => endpoint.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Buckets {
    seconds: BTreeMap<u64, u32>,
    minutes: BTreeMap<u64, u32>,
}

impl Buckets {
    fn prune(&mut self, second: u64, minute: u64) {
        self.seconds.retain(|&bucket, _| bucket + RETAINED_BUCKETS > second);
        self.minutes.retain(|&bucket, _| bucket + RETAINED_BUCKETS > minute);
    }
}

/// A per-key request throttle.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    origin: Instant,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// Creates a new limiter whose buckets start now.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            origin: Instant::now(),
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits until one more request may be admitted, then records it.
    pub async fn acquire(&self) {
        loop {
            match self.try_admit() {
                None => return,
                Some(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for next bucket");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Reserved for explicit token return; admission is purely time-based.
    pub fn release(&self) {}

    /// Returns `(current second count, current minute count)`.
    #[must_use]
    pub fn current_counts(&self) -> (u32, u32) {
        let now_ms = self.elapsed_ms();
        let buckets = self.buckets.lock();
        (
            buckets.seconds.get(&(now_ms / SECOND_MS)).copied().unwrap_or(0),
            buckets.minutes.get(&(now_ms / MINUTE_MS)).copied().unwrap_or(0),
        )
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Admits and records a request, or returns how long to wait.
    fn try_admit(&self) -> Option<Duration> {
        let now_ms = self.elapsed_ms();
        let second = now_ms / SECOND_MS;
        let minute = now_ms / MINUTE_MS;

        let mut buckets = self.buckets.lock();
        buckets.prune(second, minute);

        let second_count = buckets.seconds.get(&second).copied().unwrap_or(0);
        let minute_count = buckets.minutes.get(&minute).copied().unwrap_or(0);

        let second_full = self
            .config
            .max_requests_per_second
            .is_some_and(|max| second_count >= max);
        let minute_full = self
            .config
            .max_requests_per_minute
            .is_some_and(|max| minute_count >= max);

        if !second_full && !minute_full {
            *buckets.seconds.entry(second).or_insert(0) += 1;
            *buckets.minutes.entry(minute).or_insert(0) += 1;
            return None;
        }

        let mut wait_ms = 0;
        if second_full {
            wait_ms = wait_ms.max(SECOND_MS - now_ms % SECOND_MS);
        }
        if minute_full {
            wait_ms = wait_ms.max(MINUTE_MS - now_ms % MINUTE_MS);
        }
        Some(Duration::from_millis(wait_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_per_second_excess_deferred_to_next_second() {
        let limiter = RateLimiter::new(RateLimitConfig::new().per_second(2));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(limiter.current_counts().0, 2);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(limiter.current_counts().0, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_ceiling_waits_for_minute_boundary() {
        let limiter = RateLimiter::new(RateLimitConfig::new().per_minute(3));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(RateLimitConfig::new());
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.release();
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_buckets_are_pruned() {
        let limiter = RateLimiter::new(RateLimitConfig::new().per_second(10));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(7)).await;
        limiter.acquire().await;

        let buckets = limiter.buckets.lock();
        assert_eq!(buckets.seconds.len(), 1);
        assert!(buckets.seconds.contains_key(&7));
    }

    #[test]
    fn test_key_prefix() {
        let config = RateLimitConfig::new().with_key_prefix("tenant-a:");
        assert_eq!(config.key_for("https://api.example.com"), "tenant-a:https://api.example.com");
        assert_eq!(RateLimitConfig::new().key_for("x"), "x");
    }

    #[test]
    fn test_deserialize_wire_shape() {
        let config: RateLimitConfig = serde_json::from_value(serde_json::json!({
            "maxRequestsPerSecond": 5,
            "keyPrefix": "svc:"
        }))
        .unwrap();
        assert_eq!(config.max_requests_per_second, Some(5));
        assert_eq!(config.max_requests_per_minute, None);
    }
}
