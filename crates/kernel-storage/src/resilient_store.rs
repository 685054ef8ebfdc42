// SPDX-License-Identifier: MIT

//! Resilient Store (spec.md §4.1): a typed key-value snapshot persisted as
//! a single JSON file per namespace, replaced atomically.
//!
//! Persists state with a `schemaVersion`-style `v` field and rotates
//! numbered `.bak` files, generalized to an arbitrary serializable state
//! type shared by the idempotency index and other snapshot-backed state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of a [`ResilientStore::load`] call, so callers can observe
/// whether a recoverable corruption occurred without treating it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No snapshot existed yet; the returned state is the type default.
    Missing,
    /// The primary file loaded cleanly.
    Loaded,
    /// The primary file was truncated/malformed; the `.bak` sibling was
    /// used instead.
    RecoveredFromBackup,
    /// Both the primary file and its `.bak` sibling were unreadable; the
    /// returned state is the type default. This is the "recoverable
    /// error" case from spec.md §4.1 — the caller should log it but boot
    /// may proceed.
    CorruptFellBackToDefault,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    state: T,
}

const CURRENT_SCHEMA_VERSION: u32 = 1;

pub struct ResilientStore<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> ResilientStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: std::marker::PhantomData }
    }

    fn bak_path(&self) -> PathBuf {
        append_sibling(&self.path, ".bak")
    }

    fn read_envelope(path: &Path) -> Result<T, StoreError> {
        let bytes = fs::read(path)?;
        let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
        Ok(envelope.state)
    }

    /// Load the persisted state, falling back to `.bak` then to `T::default()`
    /// on corruption (spec.md §4.1).
    pub fn load(&self) -> Result<(T, LoadOutcome), StoreError> {
        if !self.path.exists() {
            return Ok((T::default(), LoadOutcome::Missing));
        }
        match Self::read_envelope(&self.path) {
            Ok(state) => Ok((state, LoadOutcome::Loaded)),
            Err(primary_err) => {
                warn!(path = %self.path.display(), error = %primary_err, "resilient store primary file unreadable, trying backup");
                let bak = self.bak_path();
                if bak.exists() {
                    match Self::read_envelope(&bak) {
                        Ok(state) => Ok((state, LoadOutcome::RecoveredFromBackup)),
                        Err(bak_err) => {
                            warn!(path = %bak.display(), error = %bak_err, "resilient store backup also unreadable, falling back to empty state");
                            Ok((T::default(), LoadOutcome::CorruptFellBackToDefault))
                        }
                    }
                } else {
                    Ok((T::default(), LoadOutcome::CorruptFellBackToDefault))
                }
            }
        }
    }

    /// Atomically replace the persisted state: back up the current file,
    /// write a temp file, fsync it, rename over the target, then fsync the
    /// parent directory so the rename itself is durable.
    pub fn save(&self, state: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            let _ = fs::copy(&self.path, self.bak_path());
        }

        let envelope = Envelope { schema_version: CURRENT_SCHEMA_VERSION, state };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let tmp_path = append_sibling(&self.path, ".tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

fn append_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().and_then(|n| n.to_str()).unwrap_or("store").to_string();
    name.push_str(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
    struct Counter {
        value: u32,
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store: ResilientStore<Counter> = ResilientStore::new(dir.path().join("state.json"));
        let (state, outcome) = store.load().unwrap();
        assert_eq!(state, Counter::default());
        assert_eq!(outcome, LoadOutcome::Missing);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store: ResilientStore<Counter> = ResilientStore::new(dir.path().join("state.json"));
        store.save(&Counter { value: 42 }).unwrap();
        let (state, outcome) = store.load().unwrap();
        assert_eq!(state, Counter { value: 42 });
        assert_eq!(outcome, LoadOutcome::Loaded);
    }

    #[test]
    fn corrupted_primary_recovers_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store: ResilientStore<Counter> = ResilientStore::new(&path);
        store.save(&Counter { value: 1 }).unwrap();
        store.save(&Counter { value: 2 }).unwrap();
        // Corrupt the primary file; .bak should hold the value-1 snapshot.
        fs::write(&path, b"{not json").unwrap();
        let (state, outcome) = store.load().unwrap();
        assert_eq!(outcome, LoadOutcome::RecoveredFromBackup);
        assert_eq!(state, Counter { value: 1 });
    }

    #[test]
    fn both_corrupted_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        fs::write(append_sibling(&path, ".bak"), b"also not json").unwrap();
        let store: ResilientStore<Counter> = ResilientStore::new(&path);
        let (state, outcome) = store.load().unwrap();
        assert_eq!(outcome, LoadOutcome::CorruptFellBackToDefault);
        assert_eq!(state, Counter::default());
    }
}
