// SPDX-License-Identifier: MIT

//! Workspace-level end-to-end scenarios (spec.md §8, S1-S6). Each test
//! exercises the public API the way an operator or the kernel's own
//! boot path would, rather than a single crate's internals.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use kernel_adapters::agent_session::fake::FakeAgentSessionSpawner;
use kernel_adapters::issue_tracker::fake::FakeIssueTracker;
use kernel_adapters::manifest_source::fake::FakeSource;
use kernel_adapters::{IssueTrackerCli, ManifestSource, SessionOutcome};
use kernel_core::clock::FakeClock;
use kernel_core::{BootId, Clock, CompensationStrategy, DedupStatus, LockOwnerId, Manifest, Metrics, OperatingMode, RestoreSource};
use kernel_runtime::executor::{Capability, CompensationTable, HardenedExecutor, Step, StepError, StepFn, StepOutcome};
use kernel_runtime::{BootConfig, BootOrchestrator, LoopDetectorConfig, RecoveryEngine, RecoveryOutcome, WorkQueue};
use kernel_storage::{AuditTrail, IdempotencyIndex, LockManager};

struct AlwaysOk;
impl StepFn for AlwaysOk {
    fn call(&self, _step: &Step) -> Result<serde_json::Value, StepError> {
        Ok(serde_json::json!({"prNumber": 42}))
    }
}

fn make_step(id: &str) -> Step {
    Step {
        id: id.into(),
        skill: "create_pr".into(),
        scope: "r/main".into(),
        resource: "pr/2".into(),
        capability: Capability::Write,
        input: serde_json::json!({"pr": 2}),
    }
}

/// S1 - crash after `markPending`, before any result: reconciliation
/// leaves the entry pending for the caller's compensation strategy.
#[tokio::test]
async fn s1_crash_after_mark_pending_leaves_entry_pending_on_reboot() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FakeClock::new(1_000));

    let audit = AuditTrail::open(dir.path().join("audit.jsonl"), None, clock.clone()).unwrap();
    let dedup = IdempotencyIndex::open(dir.path().join("dedup.json")).unwrap();
    let seq = audit.record_intent("create_pr", "r/main", serde_json::json!({"pr": 2}), "k2").unwrap();
    assert_eq!(seq, 1);
    dedup.mark_pending("k2", seq, CompensationStrategy::CheckThenRetry, 1_000).unwrap();
    // process dies here; nothing else is written.
    drop(audit);
    drop(dedup);

    // Reboot: reopen both stores against the same paths.
    let audit = AuditTrail::open(dir.path().join("audit.jsonl"), None, clock.clone()).unwrap();
    let dedup = IdempotencyIndex::open(dir.path().join("dedup.json")).unwrap();
    assert_eq!(audit.pending_intents(), std::collections::HashSet::from([1]));

    let remaining = dedup.reconcile_pending(&audit, clock.now_ms()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0, "k2");
    assert_eq!(remaining[0].1.compensation_strategy, CompensationStrategy::CheckThenRetry);
    assert_eq!(dedup.check("k2").unwrap().status, DedupStatus::Pending);
}

/// S2 - crash after `recordResult` but before `markCompleted`:
/// reconciliation promotes the entry to completed using the audit trail
/// as the source of truth, with nothing left pending.
#[tokio::test]
async fn s2_crash_after_record_result_reconciles_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FakeClock::new(1_000));

    let audit = AuditTrail::open(dir.path().join("audit.jsonl"), None, clock.clone()).unwrap();
    let dedup = IdempotencyIndex::open(dir.path().join("dedup.json")).unwrap();
    let seq = audit.record_intent("create_pr", "r/main", serde_json::json!({"pr": 2}), "k2").unwrap();
    dedup.mark_pending("k2", seq, CompensationStrategy::CheckThenRetry, 1_000).unwrap();
    audit.record_result(seq, "create_pr", "r/main", Some(serde_json::json!({"prNumber": 42})), None).unwrap();
    // process dies before markCompleted.
    drop(audit);
    drop(dedup);

    let audit = AuditTrail::open(dir.path().join("audit.jsonl"), None, clock.clone()).unwrap();
    let dedup = IdempotencyIndex::open(dir.path().join("dedup.json")).unwrap();
    assert!(audit.pending_intents().is_empty());

    let remaining = dedup.reconcile_pending(&audit, clock.now_ms()).unwrap();
    assert!(remaining.is_empty());
    assert_eq!(dedup.check("k2").unwrap().status, DedupStatus::Completed);
}

/// S3 - two concurrent workers race to claim the same `ready` task:
/// exactly one wins, and `t1`'s final labels carry no `ready` and
/// exactly one `session:*` marker.
#[tokio::test]
async fn s3_concurrent_claim_race_has_exactly_one_winner() {
    let clock = Arc::new(FakeClock::new(1_000));
    let tracker = Arc::new(FakeIssueTracker::new(|| 1_000));
    tracker.seed_task("t1", &["ready"], 0);

    let spawner = Arc::new(FakeAgentSessionSpawner::new(SessionOutcome::Success));
    let w1 = WorkQueue::new(tracker.clone(), spawner.clone(), clock.clone(), 1_800_000, Arc::new(Metrics::new()));
    let w2 = WorkQueue::new(tracker.clone(), spawner, clock, 1_800_000, Arc::new(Metrics::new()));

    let (a, b) = tokio::join!(w1.claim_next_task(), w2.claim_next_task());
    let claims: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
    assert_eq!(claims.len(), 1, "exactly one worker should win the claim");

    let task = tracker.show("t1").await.unwrap();
    assert!(!task.labels.iter().any(|l| l == "ready"));
    assert_eq!(task.labels.iter().filter(|l| l.starts_with("session:")).count(), 1);
}

/// S4 - degraded mode (forced persistent-store failure) blocks writes and
/// never invokes the underlying step function, while reads still proceed.
#[test]
fn s4_degraded_mode_blocks_writes_without_invoking_step() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FakeClock::new(1_000));
    let mut config = BootConfig::new(dir.path(), clock);
    config.persistent_store_probe = Some(Arc::new(|| Err("store unavailable".to_string())));
    let (services, report) = BootOrchestrator::boot(config).unwrap();
    assert_eq!(report.mode, OperatingMode::Degraded);

    let executor = HardenedExecutor::new(Arc::new(services), CompensationTable::new());
    let write_result = executor.advance(&make_step("s1"), &AlwaysOk);
    assert!(matches!(write_result, Err(kernel_core::KernelError::DegradedMode)));

    let mut read_step = make_step("s2");
    read_step.capability = Capability::Read;
    let read_result = executor.advance(&read_step, &AlwaysOk).unwrap();
    assert!(matches!(read_result, StepOutcome::Completed { .. }));
}

/// S5 - a lock file older than `max_age_ms`, held by the current
/// process's own PID, is recovered and re-acquired with a fresh owner id.
#[test]
fn s5_stale_lock_by_age_is_recovered_on_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FakeClock::new(10_000));
    let boot_id = BootId::new();
    let manager = LockManager::new(dir.path(), boot_id, 5_000, clock.clone());

    let locks_dir = dir.path();
    std::fs::create_dir_all(locks_dir).unwrap();
    let stale_record = serde_json::json!({
        "id": LockOwnerId::new().to_string(),
        "pid": std::process::id(),
        "boot_id": "boot-stale",
        "created_at": 0,
        "lock_version": 1,
    });
    std::fs::write(locks_dir.join("queue-claim.lock"), serde_json::to_vec(&stale_record).unwrap()).unwrap();

    let guard = manager.acquire("queue-claim").unwrap();
    assert_eq!(guard.name, "queue-claim");

    let bytes = std::fs::read(locks_dir.join("queue-claim.lock")).unwrap();
    let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["boot_id"].as_str().unwrap(), boot_id.to_string());
    assert_eq!(record["id"].as_str().unwrap(), guard.owner_id);
}

/// S6 - the VCS source's content doesn't match its own signed manifest;
/// with the mount source unavailable, the engine falls through to the
/// template source and regenerates a fresh manifest for the content root.
#[tokio::test]
async fn s6_tampered_secondary_source_falls_through_to_template() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("content");
    std::fs::create_dir_all(&root).unwrap();
    let clock = Arc::new(FakeClock::new(1_000));
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

    let mount = Arc::new(FakeSource::new(RestoreSource::Mount, false, vec![]));
    let vcs = Arc::new(FakeSource::new(RestoreSource::Vcs, true, vec![("app.txt", "tampered-content")]));
    let template = Arc::new(FakeSource::new(RestoreSource::Template, true, vec![("app.txt", "default-content")]));
    let sources: Vec<Arc<dyn ManifestSource>> = vec![mount, vcs, template];

    let engine = RecoveryEngine::new(root.clone(), signing_key, sources, clock, LoopDetectorConfig::default());
    let outcome = engine.check_and_recover().await;

    assert_eq!(outcome, RecoveryOutcome::Running { restored_from: Some(RestoreSource::Template) });
    assert_eq!(std::fs::read_to_string(root.join("app.txt")).unwrap(), "default-content");

    let manifest: Manifest = serde_json::from_slice(&std::fs::read(root.join("manifest.json")).unwrap()).unwrap();
    assert!(manifest.signature.is_some());
}
