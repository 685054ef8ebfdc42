// SPDX-License-Identifier: MIT

//! Lock ownership record (spec.md §3.3).

use serde::{Deserialize, Serialize};

/// On-disk ownership record for one named lock under `locks/<name>.lock`.
///
/// Invariants: file existence = lock held; the holder is identified by
/// `(pid, boot_id)`; `id` is regenerated on every acquisition so a racing
/// reader can detect an overwrite between its two reads (TOCTOU check).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: String,
    pub pid: u32,
    pub boot_id: String,
    pub created_at: u64,
    pub lock_version: u32,
}

/// Characters permitted in a lock name (spec.md §4.3: "Lock names must
/// match a restricted character set").
pub fn is_valid_lock_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_path_escapes() {
        assert!(!is_valid_lock_name(""));
        assert!(!is_valid_lock_name("../escape"));
        assert!(!is_valid_lock_name("has space"));
        assert!(!is_valid_lock_name("has/slash"));
    }

    #[test]
    fn accepts_restricted_charset() {
        assert!(is_valid_lock_name("queue-claim"));
        assert!(is_valid_lock_name("workflow:step_1.v2"));
    }
}
