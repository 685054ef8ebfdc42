// SPDX-License-Identifier: MIT

//! `kernelctl boot` / `status` / `reconcile` / `locks recover` — every
//! sub-command that only needs the boot orchestrator's own health report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use kernel_core::clock::SystemClock;
use kernel_runtime::{BootConfig, BootOrchestrator, CompensationTable, HardenedExecutor, HealthReport, ServicesBag, SubsystemReport};

use crate::output::{print_json, OutputFormat};

fn boot_config(data_dir: PathBuf, allow_dev: bool) -> BootConfig<SystemClock> {
    let mut config = BootConfig::new(data_dir, Arc::new(SystemClock));
    config.allow_dev = allow_dev;
    config
}

fn subsystem_json(s: &SubsystemReport) -> serde_json::Value {
    serde_json::json!({
        "id": format!("{:?}", s.id),
        "status": format!("{:?}", s.status),
        "detail": s.detail,
    })
}

fn report_json(report: &HealthReport) -> serde_json::Value {
    serde_json::json!({
        "mode": format!("{:?}", report.mode),
        "subsystems": report.subsystems.iter().map(subsystem_json).collect::<Vec<_>>(),
        "pendingIntents": report.pending_intents,
        "recoveredLocks": report.recovered_locks,
        "devModeWarnings": report.dev_mode_warnings,
    })
}

fn print_report(report: &HealthReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&report_json(report)),
        OutputFormat::Text => {
            println!("mode: {:?}", report.mode);
            for s in &report.subsystems {
                match &s.detail {
                    Some(detail) => println!("  {:?}: {:?} ({detail})", s.id, s.status),
                    None => println!("  {:?}: {:?}", s.id, s.status),
                }
            }
            if !report.pending_intents.is_empty() {
                println!("pending intents from prior crash: {:?}", report.pending_intents);
            }
            if !report.recovered_locks.is_empty() {
                println!("recovered stale locks: {:?}", report.recovered_locks);
            }
            for warning in &report.dev_mode_warnings {
                println!("warning: {warning}");
            }
            Ok(())
        }
    }
}

/// `kernelctl boot` and `kernelctl status` share this path: both run the
/// fixed boot sequence and print the resulting health report. `status`
/// only exists as a friendlier alias since the kernel keeps no running
/// daemon of its own to query.
pub fn boot(data_dir: PathBuf, allow_dev: bool, format: OutputFormat) -> Result<()> {
    let (_services, report) = BootOrchestrator::boot(boot_config(data_dir, allow_dev))?;
    print_report(&report, format)
}

/// `kernelctl locks recover`: the boot sequence already recovers stale
/// locks as step 6, so this is the boot path filtered down to that part
/// of the report.
pub fn locks_recover(data_dir: PathBuf, allow_dev: bool, format: OutputFormat) -> Result<()> {
    let (_services, report) = BootOrchestrator::boot(boot_config(data_dir, allow_dev))?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "recoveredLocks": report.recovered_locks })),
        OutputFormat::Text => {
            if report.recovered_locks.is_empty() {
                println!("no stale locks recovered");
            } else {
                for lock in &report.recovered_locks {
                    println!("recovered: {lock}");
                }
            }
            Ok(())
        }
    }
}

/// `kernelctl reconcile`: boots, then runs the hardened executor's
/// boot-time reconciliation pass over any dedup entries left pending by a
/// prior crash, printing what still needs a caller decision.
pub fn reconcile(data_dir: PathBuf, allow_dev: bool, format: OutputFormat) -> Result<()> {
    let (services, _report) = BootOrchestrator::boot(boot_config(data_dir, allow_dev))?;
    let services: Arc<ServicesBag<SystemClock>> = Arc::new(services);
    let executor = HardenedExecutor::new(services, CompensationTable::new());
    let remaining = executor.reconcile();
    match format {
        OutputFormat::Json => print_json(
            &remaining.iter().map(|(key, strategy)| serde_json::json!({"key": key, "strategy": format!("{strategy:?}")})).collect::<Vec<_>>(),
        ),
        OutputFormat::Text => {
            if remaining.is_empty() {
                println!("no pending dedup entries to reconcile");
            } else {
                for (key, strategy) in &remaining {
                    println!("{key}: {strategy:?}");
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_and_reconcile_on_fresh_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        boot(dir.path().to_path_buf(), false, OutputFormat::Text).unwrap();
        reconcile(dir.path().to_path_buf(), false, OutputFormat::Text).unwrap();
        locks_recover(dir.path().to_path_buf(), false, OutputFormat::Json).unwrap();
    }
}
