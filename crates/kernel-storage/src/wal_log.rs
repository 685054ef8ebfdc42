// SPDX-License-Identifier: MIT

//! On-disk WAL segment storage for the external-store adapter (spec.md
//! §6: `wal/<segment>.log`). Distinct from the Audit Trail: this WAL
//! tracks mutations applied to an external issue-tracker CLI, not
//! agent-step intents/results.
//!
//! Append-only event log with sequence numbers, replayed on open, with
//! size/age-based segment rotation.

use kernel_core::{Clock, WalEntry};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum WalLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct WalLogConfig {
    pub max_segment_bytes: u64,
    pub max_segment_age_ms: u64,
}

impl Default for WalLogConfig {
    fn default() -> Self {
        Self { max_segment_bytes: 8 * 1024 * 1024, max_segment_age_ms: 24 * 60 * 60 * 1000 }
    }
}

struct ActiveSegment {
    file: File,
    path: PathBuf,
    bytes_written: u64,
    opened_at: u64,
}

pub struct WalLog<C: Clock> {
    dir: PathBuf,
    config: WalLogConfig,
    active: Mutex<ActiveSegment>,
    clock: Arc<C>,
}

impl<C: Clock> WalLog<C> {
    pub fn open(dir: impl Into<PathBuf>, config: WalLogConfig, clock: Arc<C>) -> Result<Self, WalLogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let active = Self::open_or_create_active(&dir, &clock)?;
        Ok(Self { dir, config, active: Mutex::new(active), clock })
    }

    fn open_or_create_active(dir: &Path, clock: &Arc<C>) -> Result<ActiveSegment, WalLogError> {
        let segments = Self::list_segments(dir)?;
        let path = match segments.last() {
            Some(p) => p.clone(),
            None => dir.join(format!("{:020}.log", clock.now_ms())),
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(ActiveSegment { file, path, bytes_written, opened_at: clock.now_ms() })
    }

    fn list_segments(dir: &Path) -> Result<Vec<PathBuf>, WalLogError> {
        let mut segments: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
            .collect();
        segments.sort();
        Ok(segments)
    }

    /// Append a WAL entry, fsync'd before the external CLI command it
    /// brackets is invoked (spec.md §4.11).
    pub fn append(&self, entry: &WalEntry) -> Result<(), WalLogError> {
        let mut active = self.active.lock();
        let now = self.clock.now_ms();
        if active.bytes_written >= self.config.max_segment_bytes
            || now.saturating_sub(active.opened_at) >= self.config.max_segment_age_ms
        {
            let rotated = Self::open_or_create_active(&self.dir, &self.clock)?;
            // Force a new filename if rotation landed on the same segment
            // (same-millisecond reopen); append a monotonic suffix.
            let rotated = if rotated.path == active.path {
                let path = self.dir.join(format!("{now:020}-r.log"));
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                ActiveSegment { file, path, bytes_written: 0, opened_at: now }
            } else {
                rotated
            };
            *active = rotated;
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        active.file.write_all(line.as_bytes())?;
        active.file.sync_all()?;
        active.bytes_written += line.len() as u64;
        Ok(())
    }

    /// Read every entry across every segment, in file order then line
    /// order (segments are named by creation timestamp, so this is
    /// timestamp order), skipping corrupt lines with a warning.
    pub fn read_all(&self) -> Result<Vec<WalEntry>, WalLogError> {
        let mut entries = Vec::new();
        for path in Self::list_segments(&self.dir)? {
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalEntry>(&line) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt wal line"),
                }
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub fn newest_timestamp(&self) -> Result<Option<u64>, WalLogError> {
        Ok(self.read_all()?.into_iter().map(|e| e.timestamp).max())
    }
}
