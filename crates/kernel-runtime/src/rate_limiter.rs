// SPDX-License-Identifier: MIT

//! Rate Limiter (spec.md §4.5): a multi-bucket token bucket keyed by scope,
//! held entirely in memory. Not persisted across restarts — a reboot
//! admits up to burst capacity per scope, accepted as a benign pressure
//! release.

use kernel_core::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_ms: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { capacity: 10.0, refill_per_ms: 10.0 / 1_000.0 }
    }
}

struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
    last_used_ms: u64,
}

pub struct ConsumeOutcome {
    pub allowed: bool,
    pub retry_after_ms: Option<u64>,
    pub bucket: String,
}

/// In-memory token-bucket limiter. One bucket per scope, created lazily on
/// first use with the configured default, or an override from
/// [`RateLimiter::configure_scope`].
pub struct RateLimiter<C: Clock> {
    default_config: BucketConfig,
    overrides: Mutex<HashMap<String, BucketConfig>>,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Arc<C>,
}

impl<C: Clock> RateLimiter<C> {
    pub fn new(default_config: BucketConfig, clock: Arc<C>) -> Self {
        Self {
            default_config,
            overrides: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Assign a non-default bucket configuration to a specific scope
    /// (spec.md §4.5: buckets are keyed by scope, e.g. `global`,
    /// `per-workflow`).
    pub fn configure_scope(&self, scope: &str, config: BucketConfig) {
        self.overrides.lock().insert(scope.to_string(), config);
    }

    fn config_for(&self, scope: &str) -> BucketConfig {
        self.overrides.lock().get(scope).copied().unwrap_or(self.default_config)
    }

    pub fn try_consume(&self, scope: &str) -> ConsumeOutcome {
        let now = self.clock.now_ms();
        let config = self.config_for(scope);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(scope.to_string()).or_insert_with(|| Bucket {
            tokens: config.capacity,
            last_refill_ms: now,
            last_used_ms: now,
        });

        let elapsed = now.saturating_sub(bucket.last_refill_ms) as f64;
        bucket.tokens = (bucket.tokens + elapsed * config.refill_per_ms).min(config.capacity);
        bucket.last_refill_ms = now;
        bucket.last_used_ms = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            ConsumeOutcome { allowed: true, retry_after_ms: None, bucket: scope.to_string() }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = (deficit / config.refill_per_ms).ceil() as u64;
            ConsumeOutcome { allowed: false, retry_after_ms: Some(retry_after_ms), bucket: scope.to_string() }
        }
    }

    /// Evict buckets that have not been touched in `idle_after_ms`,
    /// bounding memory growth across many short-lived scopes.
    pub fn sweep_idle(&self, idle_after_ms: u64) -> usize {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_sub(b.last_used_ms) < idle_after_ms);
        before - buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::clock::FakeClock;

    #[test]
    fn admits_up_to_burst_then_denies() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(BucketConfig { capacity: 2.0, refill_per_ms: 0.001 }, clock);
        assert!(limiter.try_consume("global").allowed);
        assert!(limiter.try_consume("global").allowed);
        let third = limiter.try_consume("global");
        assert!(!third.allowed);
        assert!(third.retry_after_ms.is_some());
    }

    #[test]
    fn refills_over_time() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(BucketConfig { capacity: 1.0, refill_per_ms: 1.0 }, clock.clone());
        assert!(limiter.try_consume("scope").allowed);
        assert!(!limiter.try_consume("scope").allowed);
        clock.advance_ms(2);
        assert!(limiter.try_consume("scope").allowed);
    }

    #[test]
    fn scopes_are_independent() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(BucketConfig { capacity: 1.0, refill_per_ms: 0.001 }, clock);
        assert!(limiter.try_consume("a").allowed);
        assert!(limiter.try_consume("b").allowed);
        assert!(!limiter.try_consume("a").allowed);
    }

    #[test]
    fn sweep_removes_idle_buckets() {
        let clock = Arc::new(FakeClock::new(0));
        let limiter = RateLimiter::new(BucketConfig::default(), clock.clone());
        limiter.try_consume("stale");
        clock.advance_ms(10_000);
        assert_eq!(limiter.sweep_idle(5_000), 1);
    }
}
