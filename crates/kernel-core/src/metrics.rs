// SPDX-License-Identifier: MIT

//! Lightweight in-process counters. Not wired to an external sink —
//! observability sinks are an external collaborator — but queryable for
//! tests and the CLI's `status` output.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub admissions: AtomicU64,
    pub rate_limited: AtomicU64,
    pub degraded_rejections: AtomicU64,
    pub circuit_rejections: AtomicU64,
    pub dedup_skips: AtomicU64,
    pub breaker_trips: AtomicU64,
    pub claim_races_lost: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admissions: self.admissions.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            degraded_rejections: self.degraded_rejections.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            dedup_skips: self.dedup_skips.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
            claim_races_lost: self.claim_races_lost.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub admissions: u64,
    pub rate_limited: u64,
    pub degraded_rejections: u64,
    pub circuit_rejections: u64,
    pub dedup_skips: u64,
    pub breaker_trips: u64,
    pub claim_races_lost: u64,
}
