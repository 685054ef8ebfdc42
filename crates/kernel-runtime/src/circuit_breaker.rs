// SPDX-License-Identifier: MIT

//! Circuit Breaker (spec.md §4.4): a classic three-state machine driven by
//! a rolling time window of classified failures rather than a bare counter.
//!
//! Small enum plus a `parking_lot::Mutex`-guarded inner struct, the same
//! guarded-mutable-state shape `lock_manager` uses, generalized to the
//! breaker's rolling window and classifier precedence.

use kernel_core::{Clock, FailureClass};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub rolling_window_ms: u64,
    pub open_duration_ms: u64,
    pub half_open_probe_count: u32,
    /// Failure classes that count toward `failure_threshold`.
    pub countable: [bool; 5],
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window_ms: 60_000,
            open_duration_ms: 30_000,
            half_open_probe_count: 2,
            countable: class_mask(&[FailureClass::Transient, FailureClass::External]),
        }
    }
}

fn class_index(class: FailureClass) -> usize {
    match class {
        FailureClass::Transient => 0,
        FailureClass::Permanent => 1,
        FailureClass::Expected => 2,
        FailureClass::External => 3,
        FailureClass::RateLimited => 4,
    }
}

pub fn class_mask(classes: &[FailureClass]) -> [bool; 5] {
    let mut mask = [false; 5];
    for c in classes {
        mask[class_index(*c)] = true;
    }
    mask
}

struct Inner {
    state: BreakerState,
    failures: Vec<(u64, FailureClass)>,
    opened_at: Option<u64>,
    half_open_successes: u32,
}

/// A single breaker instance guarding one scope (spec.md §4.4's
/// `execute(fn)` semantics). Callers route the circuit-check and
/// post-invocation bookkeeping through this type; classification of the
/// underlying error into a [`FailureClass`] is the caller's job via
/// [`classify`].
pub struct CircuitBreaker<C: Clock> {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    clock: Arc<C>,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(config: BreakerConfig, clock: Arc<C>) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: Vec::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
            clock,
        }
    }

    /// The current state, lazily transitioning OPEN -> HALF_OPEN once
    /// `open_duration_ms` has elapsed (spec.md §4.4: "lazily, on next
    /// state read").
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.advance_open_to_half_open(&mut inner);
        inner.state
    }

    fn advance_open_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if self.clock.now_ms().saturating_sub(opened_at) >= self.config.open_duration_ms {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
    }

    /// Whether an invocation is currently permitted (CLOSED or HALF_OPEN).
    pub fn permits(&self) -> bool {
        !matches!(self.state(), BreakerState::Open)
    }

    /// Count of countable failures within the rolling window right now;
    /// exposed for spec.md §8 property 6 ("the count driving the OPEN
    /// transition equals the number of countable records with timestamp
    /// in `(t - window, t]`").
    pub fn rolling_count(&self) -> usize {
        let inner = self.inner.lock();
        self.countable_in_window(&inner)
    }

    fn countable_in_window(&self, inner: &Inner) -> usize {
        let now = self.clock.now_ms();
        let floor = now.saturating_sub(self.config.rolling_window_ms);
        inner
            .failures
            .iter()
            .filter(|(ts, class)| *ts > floor && *ts <= now && self.config.countable[class_index(*class)])
            .count()
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        self.advance_open_to_half_open(&mut inner);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_probe_count {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                }
            }
            BreakerState::Closed => {
                if !inner.failures.is_empty() {
                    inner.failures.remove(0);
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, class: FailureClass) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        self.advance_open_to_half_open(&mut inner);
        inner.failures.push((now, class));
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                let count = self.countable_in_window(&inner);
                if count >= self.config.failure_threshold as usize {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Context a caller can supply to steer classification precedence
/// (spec.md §8 property 7): caller override beats every automatic rule.
#[derive(Debug, Default, Clone)]
pub struct ClassifyInput {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub retry_after_header: bool,
    pub resource_should_exist: bool,
    pub override_class: Option<FailureClass>,
}

/// Maps a remote error to a [`FailureClass`] using status code, headers,
/// and optional caller overrides. Precedence (spec.md §4.4, §8 property
/// 7): caller override > rate-limit markers > 404/422/5xx defaults >
/// network-error codes > fallback to `transient`.
pub fn classify(input: &ClassifyInput) -> FailureClass {
    if let Some(class) = input.override_class {
        return class;
    }
    if input.status == Some(429) || input.retry_after_header {
        return FailureClass::RateLimited;
    }
    match input.status {
        Some(404) => {
            if input.resource_should_exist {
                FailureClass::Transient
            } else {
                FailureClass::Expected
            }
        }
        Some(422) => FailureClass::Permanent,
        Some(s) if (400..500).contains(&s) => FailureClass::Permanent,
        Some(s) if (500..600).contains(&s) => FailureClass::Transient,
        _ => {
            if input.code.as_deref().is_some_and(is_network_error_code) {
                FailureClass::External
            } else {
                FailureClass::Transient
            }
        }
    }
}

fn is_network_error_code(code: &str) -> bool {
    matches!(code, "ECONNRESET" | "ECONNREFUSED" | "ETIMEDOUT" | "EHOSTUNREACH" | "ENETUNREACH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::clock::FakeClock;

    fn breaker(threshold: u32) -> CircuitBreaker<FakeClock> {
        let clock = Arc::new(FakeClock::new(0));
        CircuitBreaker::new(
            BreakerConfig { failure_threshold: threshold, ..BreakerConfig::default() },
            clock,
        )
    }

    #[test]
    fn opens_at_threshold_one() {
        let cb = breaker(1);
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure(FailureClass::Transient);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_then_closed_after_probes() {
        let clock = Arc::new(FakeClock::new(0));
        let cb = CircuitBreaker::new(
            BreakerConfig { failure_threshold: 1, open_duration_ms: 1_000, half_open_probe_count: 2, ..BreakerConfig::default() },
            clock.clone(),
        );
        cb.record_failure(FailureClass::Transient);
        assert_eq!(cb.state(), BreakerState::Open);
        clock.advance_ms(1_000);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let clock = Arc::new(FakeClock::new(0));
        let cb = CircuitBreaker::new(
            BreakerConfig { failure_threshold: 1, open_duration_ms: 1_000, ..BreakerConfig::default() },
            clock.clone(),
        );
        cb.record_failure(FailureClass::Transient);
        clock.advance_ms(1_000);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure(FailureClass::Transient);
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn classify_precedence_order() {
        assert_eq!(
            classify(&ClassifyInput { status: Some(429), override_class: Some(FailureClass::Expected), ..Default::default() }),
            FailureClass::Expected
        );
        assert_eq!(classify(&ClassifyInput { status: Some(429), ..Default::default() }), FailureClass::RateLimited);
        assert_eq!(
            classify(&ClassifyInput { status: Some(403), retry_after_header: true, ..Default::default() }),
            FailureClass::RateLimited
        );
        assert_eq!(classify(&ClassifyInput { status: Some(404), ..Default::default() }), FailureClass::Expected);
        assert_eq!(
            classify(&ClassifyInput { status: Some(404), resource_should_exist: true, ..Default::default() }),
            FailureClass::Transient
        );
        assert_eq!(classify(&ClassifyInput { status: Some(422), ..Default::default() }), FailureClass::Permanent);
        assert_eq!(
            classify(&ClassifyInput { code: Some("ECONNRESET".into()), ..Default::default() }),
            FailureClass::External
        );
    }

    #[test]
    fn rolling_window_excludes_expired_failures() {
        let clock = Arc::new(FakeClock::new(0));
        let cb = CircuitBreaker::new(
            BreakerConfig { failure_threshold: 100, rolling_window_ms: 1_000, ..BreakerConfig::default() },
            clock.clone(),
        );
        cb.record_failure(FailureClass::Transient);
        clock.advance_ms(2_000);
        assert_eq!(cb.rolling_count(), 0);
    }
}
