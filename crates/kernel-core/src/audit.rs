// SPDX-License-Identifier: MIT

//! The audit record type (spec.md §3.1). The audit trail's on-disk
//! representation and fsync discipline live in `kernel-storage`; this is
//! the plain-data record shape shared by every crate that reads or writes it.

use serde::{Deserialize, Serialize};

/// The kind of an audit event: an intent to act, or the result of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Intent,
    Result,
}

/// One line of the append-only audit trail.
///
/// Invariants (spec.md §3.1): `seq` is strictly increasing and never
/// reused; every `Result` record's `intent_seq` refers to an earlier
/// `Intent` record in the same log; an intent is *pending* iff no result
/// with matching `intent_seq` exists yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub ts: u64,
    pub kind: RecordKind,
    pub action: String,
    pub target: String,
    /// Redacted structured payload: intents carry inputs, results carry
    /// outputs, or an error string under the `"error"` key.
    pub payload: serde_json::Value,
    /// Present only on `Intent` records.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dedup_key: Option<String>,
    /// Present only on `Result` records: back-reference to the intent.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub intent_seq: Option<u64>,
    /// Keyed HMAC over the record's canonical serialization, chained with
    /// the previous record's HMAC when a key is configured (spec.md §3.1).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hmac: Option<String>,
}

impl AuditRecord {
    pub fn is_pending_intent(&self, has_result: bool) -> bool {
        matches!(self.kind, RecordKind::Intent) && !has_result
    }

    /// The canonical byte representation used both for HMAC chaining and
    /// for the on-disk JSONL line. Canonical = this record with its own
    /// `hmac` field cleared, serialized with sorted keys via `serde_json`'s
    /// default map ordering (BTreeMap-like `Value::Object` is insertion
    /// ordered by `serde_json`'s default feature set, so callers that need
    /// strict determinism should enable the `preserve_order` independent
    /// `canonical_bytes` path below, which re-serializes through a sorted
    /// map).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("hmac");
        }
        let sorted = sort_json(value);
        serde_json::to_vec(&sorted).unwrap_or_default()
    }
}

/// Recursively re-key JSON objects into a `BTreeMap` so serialization order
/// is deterministic regardless of insertion order, for HMAC/signature
/// canonicalization.
fn sort_json(value: serde_json::Value) -> serde_json::Value {
    use std::collections::BTreeMap;
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_json(v))).collect();
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_json).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_bytes_ignore_hmac_field() {
        let mut a = AuditRecord {
            seq: 1,
            ts: 100,
            kind: RecordKind::Intent,
            action: "create_pr".into(),
            target: "r/main".into(),
            payload: serde_json::json!({"pr": 2}),
            dedup_key: Some("k1".into()),
            intent_seq: None,
            hmac: None,
        };
        let without = a.canonical_bytes();
        a.hmac = Some("deadbeef".into());
        let with = a.canonical_bytes();
        assert_eq!(without, with);
    }

    #[test]
    fn canonical_bytes_are_order_independent() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let sorted = sort_json(a);
        let bytes = serde_json::to_vec(&sorted).unwrap();
        assert_eq!(bytes, br#"{"a":2,"b":1}"#);
    }
}
