// SPDX-License-Identifier: MIT

//! Test builders shared across the workspace's crates, gated behind each
//! crate's own `test-support` feature.

use crate::audit::{AuditRecord, RecordKind};
use crate::dedup::{CompensationStrategy, DedupEntry};

pub fn intent_record(seq: u64, ts: u64, action: &str, target: &str, dedup_key: &str) -> AuditRecord {
    AuditRecord {
        seq,
        ts,
        kind: RecordKind::Intent,
        action: action.to_string(),
        target: target.to_string(),
        payload: serde_json::json!({}),
        dedup_key: Some(dedup_key.to_string()),
        intent_seq: None,
        hmac: None,
    }
}

pub fn result_record(seq: u64, ts: u64, intent_seq: u64, action: &str, target: &str) -> AuditRecord {
    AuditRecord {
        seq,
        ts,
        kind: RecordKind::Result,
        action: action.to_string(),
        target: target.to_string(),
        payload: serde_json::json!({"ok": true}),
        dedup_key: None,
        intent_seq: Some(intent_seq),
        hmac: None,
    }
}

pub fn pending_entry(intent_seq: u64, created_at: u64) -> DedupEntry {
    DedupEntry::new_pending(intent_seq, CompensationStrategy::CheckThenRetry, created_at)
}
