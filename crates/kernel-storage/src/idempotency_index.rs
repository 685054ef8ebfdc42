// SPDX-License-Identifier: MIT

//! Idempotency Index (spec.md §4.6), persisted through the Resilient Store.

use crate::resilient_store::{ResilientStore, StoreError};
use kernel_core::{CompensationStrategy, DedupEntry, DedupStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dedup key '{0}' already has a conflicting pending entry")]
    Conflict(String),
    #[error("dedup key '{0}' is not pending")]
    NotPending(String),
    #[error("dedup key '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DedupIndexState {
    entries: HashMap<String, DedupEntry>,
}

/// Audit-query callback used by [`IdempotencyIndex::reconcile_pending`]
/// (spec.md §4.6): given an intent sequence, returns whether a result has
/// been durably recorded for it.
pub trait AuditQuery: Send + Sync {
    fn has_result(&self, intent_seq: u64) -> bool;
}

impl<C: kernel_core::Clock> AuditQuery for crate::audit_trail::AuditTrail<C> {
    fn has_result(&self, intent_seq: u64) -> bool {
        self.find_result_by_intent_seq(intent_seq).is_some()
    }
}

pub struct IdempotencyIndex {
    store: ResilientStore<DedupIndexState>,
    state: Mutex<DedupIndexState>,
}

impl IdempotencyIndex {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DedupError> {
        let store = ResilientStore::new(path);
        let (state, _outcome) = store.load()?;
        Ok(Self { store, state: Mutex::new(state) })
    }

    pub fn check(&self, key: &str) -> Option<DedupEntry> {
        self.state.lock().entries.get(key).cloned()
    }

    pub fn mark_pending(
        &self,
        key: &str,
        intent_seq: u64,
        strategy: CompensationStrategy,
        created_at: u64,
    ) -> Result<(), DedupError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(key) {
            if existing.intent_seq != intent_seq {
                return Err(DedupError::Conflict(key.to_string()));
            }
            return Ok(());
        }
        state
            .entries
            .insert(key.to_string(), DedupEntry::new_pending(intent_seq, strategy, created_at));
        self.store.save(&state)?;
        Ok(())
    }

    pub fn mark_completed(&self, key: &str, completed_at: u64) -> Result<(), DedupError> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key).ok_or_else(|| DedupError::NotFound(key.to_string()))?;
        if !entry.is_pending() {
            return Err(DedupError::NotPending(key.to_string()));
        }
        entry.status = DedupStatus::Completed;
        entry.completed_at = Some(completed_at);
        self.store.save(&state)?;
        Ok(())
    }

    pub fn mark_failed(&self, key: &str, error: &str, completed_at: u64) -> Result<(), DedupError> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key).ok_or_else(|| DedupError::NotFound(key.to_string()))?;
        if !entry.is_pending() {
            return Err(DedupError::NotPending(key.to_string()));
        }
        entry.status = DedupStatus::Failed;
        entry.last_error = Some(error.to_string());
        entry.completed_at = Some(completed_at);
        self.store.save(&state)?;
        Ok(())
    }

    /// For each `pending` entry, promote it to `completed` if the audit
    /// trail already has a result for its `intent_seq`. Returns the
    /// entries that remain pending after reconciliation, for caller
    /// compensation per their strategy (spec.md §4.8.1).
    pub fn reconcile_pending(
        &self,
        audit: &dyn AuditQuery,
        now: u64,
    ) -> Result<Vec<(String, DedupEntry)>, DedupError> {
        let mut state = self.state.lock();
        let mut remaining = Vec::new();
        let mut changed = false;
        for (key, entry) in state.entries.iter_mut() {
            if !entry.is_pending() {
                continue;
            }
            if audit.has_result(entry.intent_seq) {
                entry.status = DedupStatus::Completed;
                entry.completed_at = Some(now);
                changed = true;
            } else {
                remaining.push((key.clone(), entry.clone()));
            }
        }
        if changed {
            self.store.save(&state)?;
        }
        Ok(remaining)
    }
}
