// SPDX-License-Identifier: MIT

//! Clock abstraction for testable time handling.
//!
//! Boot configuration accepts an injectable clock (spec.md §6, `now`); every
//! durability component takes a `Clock` rather than calling `SystemTime::now()`
//! directly so crash/reboot scenarios and rolling-window arithmetic are
//! reproducible in tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A clock that provides the current wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real system clock.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Fake clock for testing with controllable, monotonically-advancing time.
#[derive(Clone)]
pub struct FakeClock {
    now_ms: Arc<Mutex<u64>>,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self { now_ms: Arc::new(Mutex::new(start_ms)) }
    }

    /// Advance the clock by the given number of milliseconds.
    pub fn advance_ms(&self, delta_ms: u64) {
        *self.now_ms.lock() += delta_ms;
    }

    /// Set the clock to an absolute epoch-millisecond value.
    pub fn set_ms(&self, ms: u64) {
        *self.now_ms.lock() = ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.lock()
    }
}
