// SPDX-License-Identifier: MIT

//! Idempotency index entry (spec.md §3.2, §4.6).

use serde::{Deserialize, Serialize};

/// Retry policy attached to a dedup entry (spec.md glossary: compensation
/// strategy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    /// On future retry, do nothing.
    Skip,
    /// The action is naturally idempotent; retry freely.
    SafeRetry,
    /// Before retrying, the caller must verify absence of the side effect
    /// remotely.
    CheckThenRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStatus {
    Pending,
    Completed,
    Failed,
}

/// One entry in the idempotency index, keyed externally by `dedup_key`.
///
/// Invariants (spec.md §3.2): at most one entry per key; `pending ->
/// completed` or `pending -> failed` are the only non-identity transitions
/// once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub intent_seq: u64,
    pub status: DedupStatus,
    pub compensation_strategy: CompensationStrategy,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_error: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,
}

impl DedupEntry {
    pub fn new_pending(
        intent_seq: u64,
        strategy: CompensationStrategy,
        created_at: u64,
    ) -> Self {
        Self {
            intent_seq,
            status: DedupStatus::Pending,
            compensation_strategy: strategy,
            last_error: None,
            created_at,
            completed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, DedupStatus::Pending)
    }
}
