// SPDX-License-Identifier: MIT

//! Restore sources for the Recovery Engine (spec.md §4.10): a mounted
//! durable volume, a version-control checkout, and a packaged template —
//! tried in that order by the cascade. Each source is a capability seam so
//! the engine's ordering and loop-detection logic can be exercised without
//! a real mount, a real git remote, or a real template archive.

use async_trait::async_trait;
use kernel_core::manifest::RestoreSource;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    fn kind(&self) -> RestoreSource;

    /// Copy this source's tree into `dest`. Returns `Err` if the source is
    /// unreachable so the cascade can fall through to the next one.
    async fn restore_into(&self, dest: &Path) -> Result<(), RestoreError>;
}

/// Restores from a mounted path expected to already hold a durable copy
/// (e.g. a network volume or a sibling replica directory).
pub struct MountSource {
    pub mount_path: PathBuf,
}

#[async_trait]
impl ManifestSource for MountSource {
    fn kind(&self) -> RestoreSource {
        RestoreSource::Mount
    }

    async fn restore_into(&self, dest: &Path) -> Result<(), RestoreError> {
        if !self.mount_path.is_dir() {
            return Err(RestoreError::Unavailable(format!("{} not mounted", self.mount_path.display())));
        }
        copy_tree(&self.mount_path, dest).await
    }
}

/// Restores by checking out a known-good ref from a VCS remote, shelling
/// out to the real `git` binary with argv-only invocation.
pub struct VcsSource {
    pub remote: String,
    pub git_ref: String,
}

#[async_trait]
impl ManifestSource for VcsSource {
    fn kind(&self) -> RestoreSource {
        RestoreSource::Vcs
    }

    async fn restore_into(&self, dest: &Path) -> Result<(), RestoreError> {
        let status = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", &self.git_ref, &self.remote])
            .arg(dest)
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(RestoreError::Unavailable(format!("git clone of {} exited with {status}", self.remote)))
        }
    }
}

/// Last-resort restore: unpacks a packaged template tree shipped alongside
/// the binary. Always available, so the cascade terminates here.
pub struct TemplateSource {
    pub template_path: PathBuf,
}

#[async_trait]
impl ManifestSource for TemplateSource {
    fn kind(&self) -> RestoreSource {
        RestoreSource::Template
    }

    async fn restore_into(&self, dest: &Path) -> Result<(), RestoreError> {
        if !self.template_path.is_dir() {
            return Err(RestoreError::Unavailable(format!("{} missing", self.template_path.display())));
        }
        copy_tree(&self.template_path, dest).await
    }
}

async fn copy_tree(src: &Path, dest: &Path) -> Result<(), RestoreError> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dest))
        .await
        .map_err(|e| RestoreError::Unavailable(e.to_string()))?
}

fn copy_tree_blocking(src: &Path, dest: &Path) -> Result<(), RestoreError> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_blocking(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// A source whose availability and restored tree are fully scripted,
    /// for exercising the Recovery Engine's fall-through ordering.
    pub struct FakeSource {
        kind: RestoreSource,
        available: bool,
        files: Vec<(&'static str, &'static str)>,
        pub attempts: Mutex<u32>,
    }

    impl FakeSource {
        pub fn new(kind: RestoreSource, available: bool, files: Vec<(&'static str, &'static str)>) -> Self {
            Self { kind, available, files, attempts: Mutex::new(0) }
        }
    }

    #[async_trait]
    impl ManifestSource for FakeSource {
        fn kind(&self) -> RestoreSource {
            self.kind
        }

        async fn restore_into(&self, dest: &Path) -> Result<(), RestoreError> {
            *self.attempts.lock() += 1;
            if !self.available {
                return Err(RestoreError::Unavailable("fake source offline".into()));
            }
            std::fs::create_dir_all(dest)?;
            for (name, contents) in &self.files {
                std::fs::write(dest.join(name), contents)?;
            }
            Ok(())
        }
    }
}
