// SPDX-License-Identifier: MIT

//! Operating mode (spec.md glossary, §4.7).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// All P0 and P1 subsystems are `ok`.
    Autonomous,
    /// All P0 `ok`; some P1 `degraded`/`failed`.
    Degraded,
    /// A P0 subsystem failed but `allow_dev` was supplied at boot.
    Dev,
}

impl OperatingMode {
    /// Whether a write-capability step is permitted in this mode
    /// (spec.md §4.8 step 1: degraded mode rejects writes upfront).
    pub fn permits_write(&self) -> bool {
        !matches!(self, OperatingMode::Degraded)
    }
}
