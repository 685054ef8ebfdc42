// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kernel-runtime: the coordination logic composed on top of
//! `kernel-storage` and `kernel-adapters` — circuit breaker, rate limiter,
//! boot orchestrator, hardened executor, work queue, recovery engine, and
//! the WAL adapter for the external issue-tracker store.

pub mod boot;
pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;
pub mod recovery;
pub mod wal_adapter;
pub mod work_queue;

pub use boot::{BootConfig, BootOrchestrator, HealthReport, ServicesBag, SubsystemId, SubsystemReport, SubsystemStatus};
pub use circuit_breaker::{classify, BreakerConfig, BreakerState, CircuitBreaker, ClassifyInput};
pub use executor::{Capability, CompensationTable, HardenedExecutor, Step, StepError, StepFn, StepOutcome};
pub use rate_limiter::{BucketConfig, ConsumeOutcome, RateLimiter};
pub use recovery::{LoopDetectorConfig, RecoveryEngine, RecoveryOutcome};
pub use wal_adapter::{Mutation, WalAdapter, WalAdapterError};
pub use work_queue::{format_handoff, parse_handoff, Claim, HandoffRecord, ReleaseOutcome, WorkQueue, WorkQueueError};
