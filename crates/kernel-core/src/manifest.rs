// SPDX-License-Identifier: MIT

//! Integrity manifest (spec.md §3.6, §4.10).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where the active file set was most recently restored from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Mount,
    Vcs,
    Template,
}

/// Checksum/size/mtime record for one file covered by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub sha256: String,
    pub size_bytes: u64,
    pub mtime: u64,
}

/// Signed integrity manifest (spec.md §3.6). `files` uses a `BTreeMap` so
/// the canonical JSON used for Ed25519 signing is deterministic regardless
/// of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub generated_at: u64,
    pub files: BTreeMap<String, FileRecord>,
    pub restore_count: u32,
    pub last_restore_source: Option<RestoreSource>,
    /// Hex-encoded Ed25519 signature over the canonical serialization of
    /// every other field. `None` until [`Manifest::sign`] is called.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

impl Manifest {
    pub fn new(generated_at: u64, files: BTreeMap<String, FileRecord>) -> Self {
        Self {
            version: 1,
            generated_at,
            files,
            restore_count: 0,
            last_restore_source: None,
            signature: None,
        }
    }

    /// The bytes that get signed / HMAC'd: every field except `signature`,
    /// serialized through a canonical (key-sorted) JSON representation.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("signature");
        }
        serde_json::to_vec(&value).unwrap_or_default()
    }
}
