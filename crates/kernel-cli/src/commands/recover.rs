// SPDX-License-Identifier: MIT

//! `kernelctl recover` — runs one pass of the integrity check / restore
//! cascade against a content root, independent of the boot orchestrator
//! (the recovery engine owns its own signing key, separate from the
//! kernel's own data directory).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use kernel_adapters::{ManifestSource, MountSource, TemplateSource, VcsSource};
use kernel_core::clock::SystemClock;
use kernel_runtime::{LoopDetectorConfig, RecoveryEngine, RecoveryOutcome};

use crate::output::{print_json, OutputFormat};

fn load_or_create_signing_key(path: &std::path::Path) -> Result<SigningKey> {
    if let Ok(bytes) = std::fs::read(path) {
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("recovery key at {} is malformed", path.display()))?;
        return Ok(SigningKey::from_bytes(&key_bytes));
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, key.to_bytes()).with_context(|| format!("writing recovery key to {}", path.display()))?;
    Ok(key)
}

#[allow(clippy::too_many_arguments)]
pub async fn recover(
    root: PathBuf,
    key_path: PathBuf,
    mount: Option<PathBuf>,
    vcs_remote: Option<String>,
    vcs_ref: Option<String>,
    template: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let signing_key = load_or_create_signing_key(&key_path)?;

    let mut sources: Vec<Arc<dyn ManifestSource>> = Vec::new();
    if let Some(mount_path) = mount {
        sources.push(Arc::new(MountSource { mount_path }));
    }
    if let (Some(remote), Some(git_ref)) = (vcs_remote, vcs_ref) {
        sources.push(Arc::new(VcsSource { remote, git_ref }));
    }
    if let Some(template_path) = template {
        sources.push(Arc::new(TemplateSource { template_path }));
    }
    if sources.is_empty() {
        anyhow::bail!("at least one of --mount, --vcs-remote/--vcs-ref, or --template is required");
    }

    let engine = RecoveryEngine::new(root, signing_key, sources, Arc::new(SystemClock), LoopDetectorConfig::default());
    let outcome = engine.check_and_recover().await;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "outcome": format!("{outcome:?}") })),
        OutputFormat::Text => {
            match outcome {
                RecoveryOutcome::Running { restored_from: None } => println!("integrity ok, no restore needed"),
                RecoveryOutcome::Running { restored_from: Some(source) } => println!("restored from {source:?}"),
                RecoveryOutcome::Degraded => println!("recovery degraded: every restore source failed"),
                RecoveryOutcome::LoopDetected => println!("restore loop detected, suppressed until cooldown elapses"),
            }
            Ok(())
        }
    }
}
