// SPDX-License-Identifier: MIT

//! Hardened Executor (spec.md §4.8): the 5-step durable-write pipeline that
//! wraps every side-effecting step with admission control, dedup lookup,
//! a circuit breaker, and a durable intent/result record.
//!
//! Routes every step through a single chokepoint before touching external
//! state, with the exact 5-step sequence and compensation table below.

use kernel_core::{dedup_key, CompensationStrategy, Clock, DedupStatus, FailureClass, KernelError, Metrics, OperatingMode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::boot::ServicesBag;
use crate::circuit_breaker::ClassifyInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub skill: String,
    pub scope: String,
    pub resource: String,
    pub capability: Capability,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { outputs: serde_json::Value },
    Failed { error: String },
    /// The dedup index already had a terminal entry for this key; the
    /// underlying step function was never invoked (spec.md §4.8 step 2).
    Skipped { prior_error: Option<String> },
}

/// Static compensation-strategy table keyed by skill (spec.md §4.8),
/// defaulting to `skip` for any skill not listed.
#[derive(Default, Clone)]
pub struct CompensationTable {
    by_skill: HashMap<String, CompensationStrategy>,
}

impl CompensationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, skill: &str, strategy: CompensationStrategy) -> Self {
        self.by_skill.insert(skill.to_string(), strategy);
        self
    }

    pub fn strategy_for(&self, skill: &str) -> CompensationStrategy {
        self.by_skill.get(skill).copied().unwrap_or(CompensationStrategy::Skip)
    }
}

/// The caller-supplied step function invoked through the breaker at step
/// 4.3. It classifies its own failures via `ClassifyInput` so the breaker
/// and audit trail agree on what happened.
pub trait StepFn: Send + Sync {
    fn call(&self, step: &Step) -> Result<serde_json::Value, StepError>;
}

pub struct StepError {
    pub message: String,
    pub classify: ClassifyInput,
}

impl StepError {
    pub fn new(message: impl Into<String>, classify: ClassifyInput) -> Self {
        Self { message: message.into(), classify }
    }
}

pub struct HardenedExecutor<C: Clock> {
    services: Arc<ServicesBag<C>>,
    compensation: CompensationTable,
}

impl<C: Clock> HardenedExecutor<C> {
    pub fn new(services: Arc<ServicesBag<C>>, compensation: CompensationTable) -> Self {
        Self { services, compensation }
    }

    /// Run one step through the full 5-step pipeline.
    pub fn advance(&self, step: &Step, f: &dyn StepFn) -> Result<StepOutcome, KernelError> {
        // Step 1: admission.
        let consume = self.services.rate_limiter.try_consume(&step.scope);
        Metrics::incr(&self.services.metrics.admissions);
        if !consume.allowed {
            Metrics::incr(&self.services.metrics.rate_limited);
            return Err(KernelError::RateLimited { retry_after_ms: consume.retry_after_ms.unwrap_or(0) });
        }
        if step.capability == Capability::Write && !self.services.mode.permits_write() {
            Metrics::incr(&self.services.metrics.degraded_rejections);
            return Err(KernelError::DegradedMode);
        }
        if matches!(self.services.mode, OperatingMode::Dev) {
            warn!(step = %step.id, "proceeding in dev mode despite failed P0 subsystem");
        }

        // Step 2: dedup lookup.
        let key = dedup_key(&step.skill, &step.scope, &step.resource, &step.input);
        if let Some(entry) = self.services.dedup.check(&key) {
            match entry.status {
                DedupStatus::Completed | DedupStatus::Failed => {
                    Metrics::incr(&self.services.metrics.dedup_skips);
                    return Ok(StepOutcome::Skipped { prior_error: entry.last_error });
                }
                DedupStatus::Pending => {
                    // A prior crash left this pending; reconciliation (not
                    // this call) is responsible for resolving it, so we
                    // surface a retry-later admission error rather than
                    // double-invoking the step function.
                    return Err(KernelError::DedupConflict { key });
                }
            }
        }

        // Step 3: circuit check.
        if !self.services.breaker.permits() {
            Metrics::incr(&self.services.metrics.circuit_rejections);
            return Err(KernelError::CircuitOpen { scope: step.scope.clone() });
        }

        // Step 4: durable write pipeline. The payload is redacted right
        // before it reaches the audit trail, so what's persisted is always
        // what redaction produced at write time (spec.md §4.2, §8 property 1).
        let now = self.services.clock.now_ms();
        let redacted_input = self.services.redactor.redact(step.input.clone());
        let intent_seq = self
            .services
            .audit
            .record_intent(&step.skill, &step.resource, redacted_input, &key)
            .map_err(|e| KernelError::Fatal(e.to_string()))?;

        let strategy = self.compensation.strategy_for(&step.skill);
        self.services
            .dedup
            .mark_pending(&key, intent_seq, strategy, now)
            .map_err(|e| KernelError::Fatal(e.to_string()))?;

        match f.call(step) {
            Ok(outputs) => {
                self.services.breaker.record_success();
                let redacted_outputs = self.services.redactor.redact(outputs.clone());
                let _ = self.services.audit.record_result(intent_seq, &step.skill, &step.resource, Some(redacted_outputs), None);
                let completed_at = self.services.clock.now_ms();
                let _ = self.services.dedup.mark_completed(&key, completed_at);
                Ok(StepOutcome::Completed { outputs })
            }
            Err(err) => {
                let class = crate::circuit_breaker::classify(&err.classify);
                self.services.breaker.record_failure(class);
                if matches!(class, FailureClass::Transient | FailureClass::External) {
                    Metrics::incr(&self.services.metrics.breaker_trips);
                }
                // Best-effort: a storage failure while recording the
                // error path must never mask the original error
                // (spec.md §4.8, §7 propagation policy).
                if let Err(e) = self.services.audit.record_result(intent_seq, &step.skill, &step.resource, None, Some(&err.message)) {
                    error!(error = %e, "failed to record error result (best-effort)");
                }
                let completed_at = self.services.clock.now_ms();
                if let Err(e) = self.services.dedup.mark_failed(&key, &err.message, completed_at) {
                    error!(error = %e, "failed to mark dedup entry failed (best-effort)");
                }
                Ok(StepOutcome::Failed { error: err.message })
            }
        }
    }

    /// Reconciliation on boot (spec.md §4.8.1): promote completed-but-
    /// unmarked dedup entries and return the ones still pending so the
    /// caller can act on their compensation strategy.
    pub fn reconcile(&self) -> Vec<(String, CompensationStrategy)> {
        let now = self.services.clock.now_ms();
        match self.services.dedup.reconcile_pending(self.services.audit.as_ref(), now) {
            Ok(remaining) => remaining.into_iter().map(|(key, entry)| (key, entry.compensation_strategy)).collect(),
            Err(e) => {
                error!(error = %e, "reconciliation failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{BootConfig, BootOrchestrator};
    use kernel_core::clock::FakeClock;

    struct AlwaysOk;
    impl StepFn for AlwaysOk {
        fn call(&self, _step: &Step) -> Result<serde_json::Value, StepError> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    struct CountingFn(std::sync::atomic::AtomicU32);
    impl StepFn for CountingFn {
        fn call(&self, _step: &Step) -> Result<serde_json::Value, StepError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(serde_json::json!({"n": 1}))
        }
    }

    fn test_step(id: &str) -> Step {
        Step {
            id: id.into(),
            skill: "create_pr".into(),
            scope: "r/main".into(),
            resource: "pr/2".into(),
            capability: Capability::Write,
            input: serde_json::json!({"pr": 2}),
        }
    }

    fn boot_services(dir: &std::path::Path) -> Arc<ServicesBag<FakeClock>> {
        let clock = Arc::new(FakeClock::new(1_000));
        let config = BootConfig::new(dir, clock);
        let (services, _report) = BootOrchestrator::boot(config).unwrap();
        Arc::new(services)
    }

    #[test]
    fn at_most_once_execution_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let services = boot_services(dir.path());
        let executor = HardenedExecutor::new(services, CompensationTable::new());
        let counter = CountingFn(std::sync::atomic::AtomicU32::new(0));

        let first = executor.advance(&test_step("s1"), &counter).unwrap();
        assert!(matches!(first, StepOutcome::Completed { .. }));
        let second = executor.advance(&test_step("s2"), &counter).unwrap();
        assert!(matches!(second, StepOutcome::Skipped { .. }));
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn intent_and_result_payloads_are_redacted_before_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1_000));
        let mut config = BootConfig::new(dir.path(), clock);
        config.extra_redaction_patterns = vec![kernel_core::RedactionPattern {
            name: "token".into(),
            pattern: "sk-live-secret".into(),
            replacement: "[REDACTED]".into(),
        }];
        let (services, _report) = BootOrchestrator::boot(config).unwrap();
        let services = Arc::new(services);
        let audit_path = services.audit.path();
        let executor = HardenedExecutor::new(services, CompensationTable::new());

        struct EchoSecret;
        impl StepFn for EchoSecret {
            fn call(&self, _step: &Step) -> Result<serde_json::Value, StepError> {
                Ok(serde_json::json!({"token": "sk-live-secret"}))
            }
        }

        let mut step = test_step("s1");
        step.input = serde_json::json!({"token": "sk-live-secret"});
        let outcome = executor.advance(&step, &EchoSecret).unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));

        let on_disk = std::fs::read_to_string(audit_path).unwrap();
        assert!(!on_disk.contains("sk-live-secret"));
        assert!(on_disk.contains("[REDACTED]"));
    }

    #[test]
    fn empty_dedup_index_runs_full_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let services = boot_services(dir.path());
        let executor = HardenedExecutor::new(services, CompensationTable::new());
        let outcome = executor.advance(&test_step("s1"), &AlwaysOk).unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));
    }

    #[test]
    fn degraded_mode_blocks_write_allows_read() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1_000));
        let mut config = BootConfig::new(dir.path(), clock);
        config.persistent_store_probe = Some(Arc::new(|| Err("forced".to_string())));
        let (services, _report) = BootOrchestrator::boot(config).unwrap();
        let services = Arc::new(services);
        let executor = HardenedExecutor::new(services, CompensationTable::new());

        let write_result = executor.advance(&test_step("s1"), &AlwaysOk);
        assert!(matches!(write_result, Err(KernelError::DegradedMode)));

        let mut read_step = test_step("s2");
        read_step.capability = Capability::Read;
        let read_result = executor.advance(&read_step, &AlwaysOk).unwrap();
        assert!(matches!(read_result, StepOutcome::Completed { .. }));
    }
}
