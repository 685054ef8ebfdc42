// SPDX-License-Identifier: MIT

//! Audit Trail (spec.md §4.2): an append-only, fsync'd, HMAC-chained
//! journal. This is the system's ordering source of truth — a `Result`
//! observed implies the side effect was attempted.
//!
//! Append-only event log with sequence numbers, replayed on boot,
//! generalized with HMAC chaining, dedup-key fields, and torn-write
//! truncation on open.

use hmac::{Hmac, Mac};
use kernel_core::{AuditRecord, Clock, RecordKind};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hmac chain verification failed at seq {seq}")]
    ChainBroken { seq: u64 },
    #[error("invalid hmac key: {0}")]
    InvalidHmacKey(String),
}

struct Inner {
    file: File,
    path: PathBuf,
    next_seq: u64,
    last_hmac: Option<String>,
    results_by_intent: HashMap<u64, AuditRecord>,
    pending_intents: HashSet<u64>,
}

/// Append-only audit trail. Writes are strictly serialized via an internal
/// lock; fsync always happens before a write method returns (spec.md §5).
pub struct AuditTrail<C: Clock> {
    inner: Mutex<Inner>,
    hmac_key: Option<Vec<u8>>,
    clock: Arc<C>,
}

impl<C: Clock> AuditTrail<C> {
    /// Open (creating if absent) the journal at `path`, verifying the HMAC
    /// chain when `hmac_key` is configured and recovering from a torn
    /// final write by truncating to the last valid record boundary. The
    /// truncated tail is preserved as `<path>.torn` for forensic purposes.
    pub fn open(
        path: impl Into<PathBuf>,
        hmac_key: Option<Vec<u8>>,
        clock: Arc<C>,
    ) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let (valid_records, torn_tail_offset) = Self::read_and_validate(&path, hmac_key.as_deref())?;

        if let Some(offset) = torn_tail_offset {
            Self::quarantine_torn_tail(&path, offset)?;
        }

        let next_seq = valid_records.last().map(|r| r.seq + 1).unwrap_or(1);
        let last_hmac = valid_records.last().and_then(|r| r.hmac.clone());

        let mut results_by_intent = HashMap::new();
        let mut pending_intents = HashSet::new();
        for record in &valid_records {
            match record.kind {
                RecordKind::Intent => {
                    pending_intents.insert(record.seq);
                }
                RecordKind::Result => {
                    if let Some(intent_seq) = record.intent_seq {
                        results_by_intent.insert(intent_seq, record.clone());
                        pending_intents.remove(&intent_seq);
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(
            path = %path.display(),
            records = valid_records.len(),
            pending = pending_intents.len(),
            "audit trail initialized"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                path,
                next_seq,
                last_hmac,
                results_by_intent,
                pending_intents,
            }),
            hmac_key,
            clock,
        })
    }

    /// Read every line, verifying JSON parse-ability and (if a key is
    /// configured) the HMAC chain. Returns the valid prefix and, if the
    /// final line was unparseable (a torn write), the byte offset at which
    /// to truncate.
    fn read_and_validate(
        path: &Path,
        hmac_key: Option<&[u8]>,
    ) -> Result<(Vec<AuditRecord>, Option<u64>), AuditError> {
        if !path.exists() {
            return Ok((Vec::new(), None));
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut offset: u64 = 0;
        let mut last_good_offset: u64 = 0;
        let mut chain: Option<String> = None;
        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                offset += bytes_read as u64;
                continue;
            }
            match serde_json::from_str::<AuditRecord>(trimmed) {
                Ok(record) => {
                    if let Some(key) = hmac_key {
                        if !verify_chain_link(&record, chain.as_deref(), key)? {
                            warn!(seq = record.seq, "audit trail hmac chain broken, truncating");
                            return Ok((records, Some(offset)));
                        }
                        chain = record.hmac.clone();
                    }
                    records.push(record);
                    offset += bytes_read as u64;
                    last_good_offset = offset;
                }
                Err(_) => {
                    // Torn write: last line didn't finish writing before a crash.
                    return Ok((records, Some(last_good_offset)));
                }
            }
        }
        Ok((records, None))
    }

    fn quarantine_torn_tail(path: &Path, good_offset: u64) -> Result<(), AuditError> {
        let bytes = fs::read(path)?;
        if (good_offset as usize) >= bytes.len() {
            return Ok(());
        }
        let torn_tail = &bytes[good_offset as usize..];
        let torn_path = append_sibling(path, ".torn");
        fs::write(&torn_path, torn_tail)?;
        warn!(path = %torn_path.display(), "quarantined torn audit trail tail");

        let mut file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_offset)?;
        file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Record an intent to perform `action` against `target`. Fsyncs
    /// before returning; the returned `seq` is the authority other
    /// components key off of.
    pub fn record_intent(
        &self,
        action: &str,
        target: &str,
        payload: serde_json::Value,
        dedup_key: &str,
    ) -> Result<u64, AuditError> {
        let mut guard = self.inner.lock();
        let seq = guard.next_seq;
        let record = AuditRecord {
            seq,
            ts: self.clock.now_ms(),
            kind: RecordKind::Intent,
            action: action.to_string(),
            target: target.to_string(),
            payload,
            dedup_key: Some(dedup_key.to_string()),
            intent_seq: None,
            hmac: None,
        };
        self.append_locked(&mut guard, record)?;
        guard.pending_intents.insert(seq);
        guard.next_seq += 1;
        Ok(seq)
    }

    /// Record the result (success or error) of a previously-recorded
    /// intent. Fsyncs before returning.
    pub fn record_result(
        &self,
        intent_seq: u64,
        action: &str,
        target: &str,
        outputs: Option<serde_json::Value>,
        error: Option<&str>,
    ) -> Result<u64, AuditError> {
        let mut guard = self.inner.lock();
        let seq = guard.next_seq;
        let payload = match (outputs, error) {
            (Some(v), _) => v,
            (None, Some(err)) => serde_json::json!({ "error": err }),
            (None, None) => serde_json::Value::Null,
        };
        let record = AuditRecord {
            seq,
            ts: self.clock.now_ms(),
            kind: RecordKind::Result,
            action: action.to_string(),
            target: target.to_string(),
            payload,
            dedup_key: None,
            intent_seq: Some(intent_seq),
            hmac: None,
        };
        self.append_locked(&mut guard, record.clone())?;
        guard.results_by_intent.insert(intent_seq, record);
        guard.pending_intents.remove(&intent_seq);
        guard.next_seq += 1;
        Ok(seq)
    }

    fn append_locked(&self, guard: &mut Inner, mut record: AuditRecord) -> Result<(), AuditError> {
        if let Some(key) = &self.hmac_key {
            record.hmac = Some(compute_hmac(&record, guard.last_hmac.as_deref(), key)?);
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        guard.file.write_all(line.as_bytes())?;
        guard.file.sync_all()?;
        guard.last_hmac = record.hmac.clone();
        Ok(())
    }

    pub fn find_result_by_intent_seq(&self, seq: u64) -> Option<AuditRecord> {
        self.inner.lock().results_by_intent.get(&seq).cloned()
    }

    /// Intents with no matching result yet.
    pub fn pending_intents(&self) -> HashSet<u64> {
        self.inner.lock().pending_intents.clone()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }
}

fn compute_hmac(record: &AuditRecord, previous: Option<&str>, key: &[u8]) -> Result<String, AuditError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| AuditError::InvalidHmacKey(e.to_string()))?;
    if let Some(prev) = previous {
        mac.update(prev.as_bytes());
    }
    mac.update(&record.canonical_bytes());
    let bytes = mac.finalize().into_bytes();
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn verify_chain_link(record: &AuditRecord, previous: Option<&str>, key: &[u8]) -> Result<bool, AuditError> {
    match &record.hmac {
        Some(stored) => Ok(&compute_hmac(record, previous, key)? == stored),
        None => Ok(false),
    }
}

fn append_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("audit-trail").to_string();
    name.push_str(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::FakeClock;
    use std::io::Write as _;

    fn clock() -> Arc<FakeClock> {
        Arc::new(FakeClock::new(1000))
    }

    #[test]
    fn records_intent_and_result_durably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit-trail.jsonl");
        let trail = AuditTrail::open(&path, None, clock()).unwrap();
        let seq = trail
            .record_intent("create_pr", "r/main", serde_json::json!({"pr": 2}), "k1")
            .unwrap();
        assert_eq!(seq, 1);
        assert!(trail.pending_intents().contains(&1));

        trail
            .record_result(seq, "create_pr", "r/main", Some(serde_json::json!({"n": 42})), None)
            .unwrap();
        assert!(!trail.pending_intents().contains(&1));
        assert!(trail.find_result_by_intent_seq(1).is_some());

        // Reopen: state must be reconstructable from disk alone.
        let reopened = AuditTrail::open(&path, None, clock()).unwrap();
        assert!(reopened.find_result_by_intent_seq(1).is_some());
        assert!(reopened.pending_intents().is_empty());
    }

    #[test]
    fn survives_crash_after_intent_before_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit-trail.jsonl");
        {
            let trail = AuditTrail::open(&path, None, clock()).unwrap();
            trail
                .record_intent("create_pr", "r/main", serde_json::json!({"pr": 2}), "k2")
                .unwrap();
        }
        let reopened = AuditTrail::open(&path, None, clock()).unwrap();
        assert!(reopened.pending_intents().contains(&1));
    }

    #[test]
    fn hmac_chain_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit-trail.jsonl");
        let key = b"test-key".to_vec();
        {
            let trail = AuditTrail::open(&path, Some(key.clone()), clock()).unwrap();
            trail
                .record_intent("create_pr", "r/main", serde_json::json!({}), "k1")
                .unwrap();
        }
        // Tamper with the action field in place, corrupting the HMAC.
        let contents = fs::read_to_string(&path).unwrap();
        let tampered = contents.replace("create_pr", "delete_pr");
        fs::write(&path, tampered).unwrap();

        // The tampered record fails the chain check and is dropped/truncated,
        // so the reopened trail has no pending intents.
        let reopened = AuditTrail::open(&path, Some(key), clock()).unwrap();
        assert!(reopened.pending_intents().is_empty());
    }

    #[test]
    fn torn_write_is_truncated_and_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit-trail.jsonl");
        {
            let trail = AuditTrail::open(&path, None, clock()).unwrap();
            trail
                .record_intent("create_pr", "r/main", serde_json::json!({}), "k1")
                .unwrap();
        }
        // Simulate a torn write: append a half-written JSON line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"kind\":\"resu").unwrap();

        let reopened = AuditTrail::open(&path, None, clock()).unwrap();
        assert!(reopened.pending_intents().contains(&1));
        assert!(append_sibling(&path, ".torn").exists());
    }
}
