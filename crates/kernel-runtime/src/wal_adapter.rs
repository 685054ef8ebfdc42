// SPDX-License-Identifier: MIT

//! WAL Adapter for the external issue-tracker store (spec.md §4.11):
//! brackets every mutation with a durable, fsync'd WAL record written
//! *before* the tracker CLI command runs, so a crash mid-mutation is
//! replayable on the next boot.
//!
//! `kernel-storage::wal_log` supplies the segment storage; this module
//! owns the mutation vocabulary and the replay-on-boot dispatch.

use kernel_adapters::IssueTrackerCli;
use kernel_core::{Clock, WalEntry, WalOperation};
use kernel_storage::WalLog;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum WalAdapterError {
    #[error("wal error: {0}")]
    Wal(#[from] kernel_storage::WalLogError),
    #[error("tracker error: {0}")]
    Tracker(#[from] kernel_adapters::TrackerError),
}

/// The mutation vocabulary bracketed by WAL records (spec.md §3.7's
/// `operation` enum, with the payload shape each variant needs to replay).
#[derive(Debug, Clone)]
pub enum Mutation {
    Create { description: String, labels: Vec<String> },
    Update { description: String },
    Close,
    Reopen,
    LabelAdd(String),
    LabelRemove(String),
    CommentAdd(String),
    DepAdd(String),
    DepRemove(String),
}

impl Mutation {
    fn operation(&self) -> WalOperation {
        match self {
            Mutation::Create { .. } => WalOperation::Create,
            Mutation::Update { .. } => WalOperation::Update,
            Mutation::Close => WalOperation::Close,
            Mutation::Reopen => WalOperation::Reopen,
            Mutation::LabelAdd(_) | Mutation::LabelRemove(_) => WalOperation::Label,
            Mutation::CommentAdd(_) => WalOperation::Comment,
            Mutation::DepAdd(_) | Mutation::DepRemove(_) => WalOperation::Dep,
        }
    }

    fn payload(&self) -> serde_json::Value {
        match self {
            Mutation::Create { description, labels } => serde_json::json!({"description": description, "labels": labels}),
            Mutation::Update { description } => serde_json::json!({"description": description}),
            Mutation::Close | Mutation::Reopen => serde_json::Value::Null,
            Mutation::LabelAdd(label) => serde_json::json!({"action": "add", "label": label}),
            Mutation::LabelRemove(label) => serde_json::json!({"action": "remove", "label": label}),
            Mutation::CommentAdd(text) => serde_json::json!({"text": text}),
            Mutation::DepAdd(target) => serde_json::json!({"action": "add", "target": target}),
            Mutation::DepRemove(target) => serde_json::json!({"action": "remove", "target": target}),
        }
    }

    fn from_entry(entry: &WalEntry) -> Option<Mutation> {
        let p = &entry.payload;
        match entry.operation {
            WalOperation::Create => Some(Mutation::Create {
                description: p.get("description")?.as_str()?.to_string(),
                labels: p.get("labels")?.as_array()?.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            }),
            WalOperation::Update => Some(Mutation::Update { description: p.get("description")?.as_str()?.to_string() }),
            WalOperation::Close => Some(Mutation::Close),
            WalOperation::Reopen => Some(Mutation::Reopen),
            WalOperation::Label => {
                let label = p.get("label")?.as_str()?.to_string();
                match p.get("action")?.as_str()? {
                    "add" => Some(Mutation::LabelAdd(label)),
                    "remove" => Some(Mutation::LabelRemove(label)),
                    _ => None,
                }
            }
            WalOperation::Comment => Some(Mutation::CommentAdd(p.get("text")?.as_str()?.to_string())),
            WalOperation::Dep => {
                let target = p.get("target")?.as_str()?.to_string();
                match p.get("action")?.as_str()? {
                    "add" => Some(Mutation::DepAdd(target)),
                    "remove" => Some(Mutation::DepRemove(target)),
                    _ => None,
                }
            }
        }
    }
}

pub struct WalAdapter<C: Clock> {
    wal: Arc<WalLog<C>>,
    tracker: Arc<dyn IssueTrackerCli>,
    clock: Arc<C>,
}

impl<C: Clock> WalAdapter<C> {
    pub fn new(wal: Arc<WalLog<C>>, tracker: Arc<dyn IssueTrackerCli>, clock: Arc<C>) -> Self {
        Self { wal, tracker, clock }
    }

    /// Append the WAL record (fsync) *before* invoking the tracker command
    /// it brackets (spec.md §4.11).
    pub async fn record_transition(&self, target_id: &str, mutation: Mutation) -> Result<(), WalAdapterError> {
        let entry = WalEntry {
            id: kernel_core::WalEntryId::new().to_string(),
            timestamp: self.clock.now_ms(),
            operation: mutation.operation(),
            target_id: target_id.to_string(),
            payload: mutation.payload(),
            checksum: WalEntry::compute_checksum(mutation.operation(), target_id, &mutation.payload()),
        };
        self.wal.append(&entry)?;
        self.apply(target_id, &mutation).await
    }

    async fn apply(&self, target_id: &str, mutation: &Mutation) -> Result<(), WalAdapterError> {
        match mutation {
            Mutation::Create { description, labels } => {
                self.tracker.create(description, labels).await?;
            }
            Mutation::Update { description } => self.tracker.update(target_id, description).await?,
            Mutation::Close => self.tracker.close(target_id).await?,
            Mutation::Reopen => self.tracker.reopen(target_id).await?,
            Mutation::LabelAdd(label) => self.tracker.label_add(target_id, label).await?,
            Mutation::LabelRemove(label) => self.tracker.label_remove(target_id, label).await?,
            Mutation::CommentAdd(text) => self.tracker.comment_add(target_id, text).await?,
            Mutation::DepAdd(target) => self.tracker.dep_add(target_id, target).await?,
            Mutation::DepRemove(target) => self.tracker.dep_remove(target_id, target).await?,
        }
        Ok(())
    }

    /// Newest WAL timestamp vs. the CLI store's own file mtime: a newer
    /// WAL means the external store lags behind and must be replayed.
    pub fn needs_recovery(&self, cli_store_mtime_ms: u64) -> Result<bool, WalAdapterError> {
        Ok(self.wal.newest_timestamp()?.is_some_and(|ts| ts > cli_store_mtime_ms))
    }

    /// Stream WAL entries in timestamp order, verify each checksum
    /// (skipping corrupt ones with a warning), group by `targetId` for
    /// observability, and re-issue the corresponding CLI commands.
    pub async fn replay(&self) -> Result<usize, WalAdapterError> {
        let entries = self.wal.read_all()?;
        let mut by_target: HashMap<String, usize> = HashMap::new();
        let mut replayed = 0;
        for entry in &entries {
            if !entry.verify_checksum() {
                warn!(id = %entry.id, "skipping wal entry with bad checksum");
                continue;
            }
            let Some(mutation) = Mutation::from_entry(entry) else {
                warn!(id = %entry.id, "skipping wal entry with unparseable payload");
                continue;
            };
            *by_target.entry(entry.target_id.clone()).or_insert(0) += 1;
            self.apply(&entry.target_id, &mutation).await?;
            replayed += 1;
        }
        self.tracker.sync().await?;
        Ok(replayed)
    }
}
