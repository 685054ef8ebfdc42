// SPDX-License-Identifier: MIT

//! `kernelctl wal replay` — drains the WAL adapter's segment store against
//! the real issue-tracker binary, for use after a crash where
//! `needs_recovery()` would report the external store stale.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use kernel_adapters::SubprocessIssueTrackerCli;
use kernel_core::clock::SystemClock;
use kernel_runtime::WalAdapter;
use kernel_storage::{WalLog, WalLogConfig};

use crate::output::{print_json, OutputFormat};

pub async fn replay(wal_dir: PathBuf, tracker_bin: String, format: OutputFormat) -> Result<()> {
    let clock = Arc::new(SystemClock);
    let wal = Arc::new(WalLog::open(wal_dir, WalLogConfig::default(), clock.clone())?);
    let tracker = Arc::new(SubprocessIssueTrackerCli::new(tracker_bin));
    let adapter = WalAdapter::new(wal, tracker, clock);
    let replayed = adapter.replay().await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "replayed": replayed })),
        OutputFormat::Text => {
            println!("replayed {replayed} wal entries");
            Ok(())
        }
    }
}
