// SPDX-License-Identifier: MIT

//! CLI command implementations

pub mod boot;
pub mod recover;
pub mod wal;
