// SPDX-License-Identifier: MIT

//! Work Queue (spec.md §4.9): drives bounded-time agent sessions, one task
//! per session, using the issue tracker's labels as the only state machine
//! and a TOCTOU re-read as the only claim-race guard.
//!
//! A tick-driven scheduling loop: claims one unit of work at a time and
//! posts status back to an external system via the label vocabulary and
//! handoff protocol below.

use kernel_adapters::{AgentSessionSpawner, IssueTrackerCli, SessionOutcome};
use kernel_core::policy::is_valid_external_id;
use kernel_core::{Clock, Metrics, SessionId};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const READY: &str = "ready";
const IN_PROGRESS: &str = "in_progress";
const BLOCKED: &str = "blocked";
const DONE: &str = "done";
const SESSION_PREFIX: &str = "session:";
const HANDOFF_PREFIX: &str = "handoff:";
const HANDOFF_BEGIN: &str = "--- SESSION HANDOFF ---";
const HANDOFF_END: &str = "--- END HANDOFF ---";

#[derive(Debug, Error)]
pub enum WorkQueueError {
    #[error("invalid task id: {0}")]
    InvalidId(String),
    #[error("tracker error: {0}")]
    Tracker(#[from] kernel_adapters::TrackerError),
}

fn check_id(id: &str) -> Result<(), WorkQueueError> {
    if is_valid_external_id(id) {
        Ok(())
    } else {
        Err(WorkQueueError::InvalidId(id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub task_id: String,
    pub session_id: SessionId,
    pub claimed_at_ms: u64,
}

#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Done,
    Blocked { reason: String },
}

#[derive(Debug, Clone)]
pub struct HandoffRecord {
    pub session_id: SessionId,
    pub files_changed: Vec<String>,
    pub current_state: String,
    pub next_steps: String,
    pub tokens_used: u64,
    pub timestamp: u64,
}

/// Render a handoff record as the strictly-delimited comment body the
/// tracker stores (spec.md §4.9). `parse_handoff` is its exact inverse,
/// modulo timestamp re-derivation on re-parse.
pub fn format_handoff(record: &HandoffRecord) -> String {
    format!(
        "{HANDOFF_BEGIN}\nsession_id: {}\nfiles_changed: {}\ncurrent_state: {}\nnext_steps: {}\ntokens_used: {}\ntimestamp: {}\n{HANDOFF_END}",
        record.session_id,
        record.files_changed.join(","),
        record.current_state,
        record.next_steps,
        record.tokens_used,
        record.timestamp,
    )
}

pub fn parse_handoff(body: &str) -> Option<HandoffRecord> {
    let start = body.find(HANDOFF_BEGIN)?;
    let end = body[start..].find(HANDOFF_END)? + start;
    let block = &body[start + HANDOFF_BEGIN.len()..end];

    let mut session_id = None;
    let mut files_changed = Vec::new();
    let mut current_state = String::new();
    let mut next_steps = String::new();
    let mut tokens_used = 0u64;
    let mut timestamp = 0u64;

    for line in block.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim() {
            "session_id" => session_id = Some(SessionId::from_string(value)),
            "files_changed" => {
                files_changed = if value.is_empty() { Vec::new() } else { value.split(',').map(|s| s.to_string()).collect() }
            }
            "current_state" => current_state = value.to_string(),
            "next_steps" => next_steps = value.to_string(),
            "tokens_used" => tokens_used = value.parse().unwrap_or(0),
            "timestamp" => timestamp = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    Some(HandoffRecord { session_id: session_id?, files_changed, current_state, next_steps, tokens_used, timestamp })
}

fn parse_claim_timestamp(comment_body: &str) -> Option<u64> {
    // "Claimed by session <id> at <ts>"
    let idx = comment_body.find(" at ")?;
    comment_body[idx + 4..].trim().parse().ok()
}

pub struct WorkQueue<C: Clock> {
    tracker: Arc<dyn IssueTrackerCli>,
    spawner: Arc<dyn AgentSessionSpawner>,
    clock: Arc<C>,
    session_timeout_ms: u64,
    metrics: Arc<Metrics>,
}

impl<C: Clock> WorkQueue<C> {
    pub fn new(
        tracker: Arc<dyn IssueTrackerCli>,
        spawner: Arc<dyn AgentSessionSpawner>,
        clock: Arc<C>,
        session_timeout_ms: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { tracker, spawner, clock, session_timeout_ms, metrics }
    }

    /// Claim (spec.md §4.9): list `ready` tasks by priority, claim the
    /// first, then TOCTOU re-check for a losing race against another
    /// claimant.
    pub async fn claim_next_task(&self) -> Result<Option<Claim>, WorkQueueError> {
        let mut candidates = self.tracker.list(READY, "").await?;
        candidates.sort_by_key(|t| t.priority);
        let Some(task) = candidates.into_iter().next() else { return Ok(None) };
        check_id(&task.id)?;

        let session_id = SessionId::new();
        let claimed_at = self.clock.now_ms();

        self.tracker.label_remove(&task.id, READY).await?;
        self.tracker.label_add(&task.id, IN_PROGRESS).await?;
        self.tracker.label_add(&task.id, &format!("{SESSION_PREFIX}{session_id}")).await?;
        self.tracker
            .comment_add(&task.id, &format!("Claimed by session {session_id} at {claimed_at}"))
            .await?;

        let refreshed = self.tracker.show(&task.id).await?;
        let session_labels: Vec<&String> = refreshed.labels.iter().filter(|l| l.starts_with(SESSION_PREFIX)).collect();
        if session_labels.len() > 1 {
            warn!(task = %task.id, "lost claim race, backing off");
            Metrics::incr(&self.metrics.claim_races_lost);
            self.tracker.label_remove(&task.id, IN_PROGRESS).await?;
            self.tracker.label_remove(&task.id, &format!("{SESSION_PREFIX}{session_id}")).await?;
            self.tracker.label_add(&task.id, READY).await?;
            return Ok(None);
        }

        Ok(Some(Claim { task_id: task.id, session_id, claimed_at_ms: claimed_at }))
    }

    /// Execute (spec.md §4.9): spawn the bounded-time agent session and
    /// classify its exit.
    pub async fn execute(&self, claim: &Claim, workdir: &Path, timeout: Duration) -> Result<SessionOutcome, WorkQueueError> {
        check_id(&claim.task_id)?;
        let outcome = self
            .spawner
            .spawn(&claim.task_id, &workdir.to_path_buf(), timeout)
            .await
            .unwrap_or(SessionOutcome::Error { exit_code: None });
        if let SessionOutcome::Error { exit_code } = outcome {
            self.tracker
                .comment_add(&claim.task_id, &format!("Session {} failed (exit {:?})", claim.session_id, exit_code))
                .await?;
        }
        Ok(outcome)
    }

    /// Release (spec.md §4.9): fold the session's terminal state back into
    /// labels, closing the task only on `Done`.
    pub async fn release(&self, task_id: &str, outcome: ReleaseOutcome) -> Result<(), WorkQueueError> {
        check_id(task_id)?;
        self.tracker.label_remove(task_id, IN_PROGRESS).await?;
        match outcome {
            ReleaseOutcome::Done => {
                self.tracker.label_add(task_id, DONE).await?;
                self.tracker.close(task_id).await?;
                self.tracker.comment_add(task_id, &format!("Completed at {}", self.clock.now_ms())).await?;
            }
            ReleaseOutcome::Blocked { reason } => {
                self.tracker.label_add(task_id, BLOCKED).await?;
                self.tracker.comment_add(task_id, &format!("Blocked: {reason}")).await?;
            }
        }
        Ok(())
    }

    pub async fn record_handoff(&self, task_id: &str, record: &HandoffRecord) -> Result<(), WorkQueueError> {
        check_id(task_id)?;
        self.tracker.comment_add(task_id, &format_handoff(record)).await?;
        self.tracker.label_add(task_id, &format!("{HANDOFF_PREFIX}{}", record.session_id)).await?;
        Ok(())
    }

    /// Scan comments newest-first for a handoff block; fall back to the
    /// task description for backward compatibility (spec.md §4.9).
    pub async fn previous_handoff(&self, task_id: &str) -> Result<Option<HandoffRecord>, WorkQueueError> {
        check_id(task_id)?;
        let mut comments = self.tracker.comments_list(task_id).await?;
        comments.reverse();
        for comment in &comments {
            if let Some(record) = parse_handoff(&comment.body) {
                return Ok(Some(record));
            }
        }
        let task = self.tracker.show(task_id).await?;
        Ok(parse_handoff(&task.description))
    }

    /// Stale-session recovery (spec.md §4.9): run periodically; malformed
    /// claim timestamps are skipped, never recovered, to avoid false
    /// positives.
    pub async fn recover_stale_sessions(&self) -> Result<Vec<String>, WorkQueueError> {
        let now = self.clock.now_ms();
        let in_progress = self.tracker.list(IN_PROGRESS, "").await?;
        let mut recovered = Vec::new();
        for task in in_progress {
            let comments = self.tracker.comments_list(&task.id).await?;
            let claimed_at = comments
                .iter()
                .rev()
                .find_map(|c| c.body.strip_prefix("Claimed by session").and_then(|_| parse_claim_timestamp(&c.body)));
            let Some(claimed_at) = claimed_at else { continue };
            if now.saturating_sub(claimed_at) <= self.session_timeout_ms {
                continue;
            }
            self.tracker.label_remove(&task.id, IN_PROGRESS).await?;
            for label in task.labels.iter().filter(|l| l.starts_with(SESSION_PREFIX)) {
                self.tracker.label_remove(&task.id, label).await?;
            }
            self.tracker.label_add(&task.id, READY).await?;
            self.tracker.comment_add(&task.id, "stale session detected").await?;
            info!(task = %task.id, "recovered stale session");
            recovered.push(task.id);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_adapters::agent_session::fake::FakeAgentSessionSpawner;
    use kernel_adapters::issue_tracker::fake::FakeIssueTracker;
    use kernel_core::clock::FakeClock;

    fn queue(clock: Arc<FakeClock>, tracker: Arc<FakeIssueTracker>) -> WorkQueue<FakeClock> {
        let spawner = Arc::new(FakeAgentSessionSpawner::new(SessionOutcome::Success));
        WorkQueue::new(tracker, spawner, clock, 1_800_000, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let clock = Arc::new(FakeClock::new(1_000));
        let tracker = Arc::new(FakeIssueTracker::new(|| 1_000));
        let q = queue(clock, tracker);
        assert!(q.claim_next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_and_releases_done() {
        let clock = Arc::new(FakeClock::new(1_000));
        let tracker = Arc::new(FakeIssueTracker::new(|| 1_000));
        tracker.seed_task("t1", &[READY], 0);
        let q = queue(clock, tracker.clone());

        let claim = q.claim_next_task().await.unwrap().expect("claim");
        assert_eq!(claim.task_id, "t1");
        let task = tracker.show("t1").await.unwrap();
        assert!(task.labels.iter().any(|l| l == IN_PROGRESS));
        assert!(!task.labels.iter().any(|l| l == READY));

        q.release("t1", ReleaseOutcome::Done).await.unwrap();
        let task = tracker.show("t1").await.unwrap();
        assert_eq!(task.status, "closed");
        assert!(task.labels.iter().any(|l| l == DONE));
    }

    #[tokio::test]
    async fn handoff_round_trips() {
        let record = HandoffRecord {
            session_id: SessionId::new(),
            files_changed: vec!["a.rs".into(), "b.rs".into()],
            current_state: "mid-refactor".into(),
            next_steps: "run tests".into(),
            tokens_used: 4242,
            timestamp: 999,
        };
        let body = format_handoff(&record);
        let parsed = parse_handoff(&body).expect("parses");
        assert_eq!(parsed.session_id, record.session_id);
        assert_eq!(parsed.files_changed, record.files_changed);
        assert_eq!(parsed.current_state, record.current_state);
        assert_eq!(parsed.next_steps, record.next_steps);
        assert_eq!(parsed.tokens_used, record.tokens_used);
    }

    #[tokio::test]
    async fn malformed_claim_timestamp_is_skipped_not_recovered() {
        let clock = Arc::new(FakeClock::new(1_000));
        let tracker = Arc::new(FakeIssueTracker::new(|| 1_000));
        tracker.seed_task("t1", &[IN_PROGRESS, "session:sess-x"], 0);
        tracker.comment_add("t1", "Claimed by session sess-x at not-a-number").await.unwrap();
        let q = queue(clock.clone(), tracker.clone());

        clock.advance_ms(10_000_000);
        let recovered = q.recover_stale_sessions().await.unwrap();
        assert!(recovered.is_empty());
        let task = tracker.show("t1").await.unwrap();
        assert!(task.labels.iter().any(|l| l == IN_PROGRESS));
    }

    #[tokio::test]
    async fn old_claim_is_recovered_to_ready() {
        let clock = Arc::new(FakeClock::new(1_000));
        let tracker = Arc::new(FakeIssueTracker::new(|| 1_000));
        tracker.seed_task("t1", &[IN_PROGRESS, "session:sess-x"], 0);
        tracker.comment_add("t1", "Claimed by session sess-x at 1000").await.unwrap();
        let q = queue(clock.clone(), tracker.clone());

        clock.advance_ms(10_000_000);
        let recovered = q.recover_stale_sessions().await.unwrap();
        assert_eq!(recovered, vec!["t1".to_string()]);
        let task = tracker.show("t1").await.unwrap();
        assert!(task.labels.iter().any(|l| l == READY));
        assert!(!task.labels.iter().any(|l| l.starts_with(SESSION_PREFIX)));
    }
}
