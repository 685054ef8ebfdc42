// SPDX-License-Identifier: MIT

//! The issue-tracker CLI contract (spec.md §6): the Work Queue and the WAL
//! Adapter both drive an external, out-of-scope issue tracker exclusively
//! through this trait, invoking the real CLI with argument vectors (never
//! shell-interpolated strings).
//!
//! Every external collaborator gets a trait plus a `test-support`-gated
//! fake, so the daemon's own logic is testable without the real binary.

use async_trait::async_trait;
use kernel_core::policy::is_valid_external_id;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),
    #[error("tracker command failed: {0}")]
    CommandFailed(String),
    #[error("tracker returned malformed output: {0}")]
    MalformedOutput(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskView {
    pub id: String,
    pub labels: Vec<String>,
    pub status: String,
    pub priority: i64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: u64,
}

fn check_id(id: &str) -> Result<(), TrackerError> {
    if is_valid_external_id(id) {
        Ok(())
    } else {
        Err(TrackerError::InvalidId(id.to_string()))
    }
}

/// One-method-per-verb capability matching the abstract CLI contract in
/// spec.md §6. Every identifier argument is validated against
/// `[A-Za-z0-9_-]{1..128}` before being handed to an implementation, so a
/// conforming implementation never needs to re-validate for injection
/// safety — it only needs to invoke argv vectors, never a shell.
#[async_trait]
pub trait IssueTrackerCli: Send + Sync {
    async fn create(&self, description: &str, labels: &[String]) -> Result<String, TrackerError>;
    async fn update(&self, id: &str, description: &str) -> Result<(), TrackerError>;
    async fn close(&self, id: &str) -> Result<(), TrackerError>;
    async fn reopen(&self, id: &str) -> Result<(), TrackerError>;
    async fn label_add(&self, id: &str, label: &str) -> Result<(), TrackerError>;
    async fn label_remove(&self, id: &str, label: &str) -> Result<(), TrackerError>;
    async fn dep_add(&self, id: &str, target: &str) -> Result<(), TrackerError>;
    async fn dep_remove(&self, id: &str, target: &str) -> Result<(), TrackerError>;
    async fn comment_add(&self, id: &str, text: &str) -> Result<(), TrackerError>;
    async fn comments_list(&self, id: &str) -> Result<Vec<Comment>, TrackerError>;
    async fn list(&self, label: &str, status: &str) -> Result<Vec<TaskView>, TrackerError>;
    async fn show(&self, id: &str) -> Result<TaskView, TrackerError>;
    async fn sync(&self) -> Result<(), TrackerError>;
}

/// Validates `id` up front so concrete CLI adapters (subprocess-based)
/// built on top of this helper never interpolate an unvalidated string
/// into an argv element.
pub fn validated(id: &str) -> Result<&str, TrackerError> {
    check_id(id)?;
    Ok(id)
}

/// Drives the out-of-scope tracker binary named by `bin` through the argv
/// contract in spec.md §6 (`create`, `update <id>`, `close <id>`, ...).
/// Every argument is passed as a vector token, never through a shell.
pub struct SubprocessIssueTrackerCli {
    pub bin: String,
}

impl SubprocessIssueTrackerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TrackerError> {
        let output = tokio::process::Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| TrackerError::CommandFailed(format!("{} {}: {e}", self.bin, args.join(" "))))?;
        if !output.status.success() {
            return Err(TrackerError::CommandFailed(format!(
                "{} {} exited {}: {}",
                self.bin,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| TrackerError::MalformedOutput(e.to_string()))
    }
}

#[async_trait]
impl IssueTrackerCli for SubprocessIssueTrackerCli {
    async fn create(&self, description: &str, labels: &[String]) -> Result<String, TrackerError> {
        let mut args = vec!["create".to_string(), description.to_string()];
        for label in labels {
            args.push("--label".to_string());
            args.push(label.clone());
        }
        let out = self.run(&args.iter().map(String::as_str).collect::<Vec<_>>()).await?;
        Ok(out.trim().to_string())
    }

    async fn update(&self, id: &str, description: &str) -> Result<(), TrackerError> {
        self.run(&["update", validated(id)?, description]).await?;
        Ok(())
    }

    async fn close(&self, id: &str) -> Result<(), TrackerError> {
        self.run(&["close", validated(id)?]).await?;
        Ok(())
    }

    async fn reopen(&self, id: &str) -> Result<(), TrackerError> {
        self.run(&["reopen", validated(id)?]).await?;
        Ok(())
    }

    async fn label_add(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        self.run(&["label", "add", validated(id)?, label]).await?;
        Ok(())
    }

    async fn label_remove(&self, id: &str, label: &str) -> Result<(), TrackerError> {
        self.run(&["label", "remove", validated(id)?, label]).await?;
        Ok(())
    }

    async fn dep_add(&self, id: &str, target: &str) -> Result<(), TrackerError> {
        self.run(&["dep", "add", validated(id)?, validated(target)?]).await?;
        Ok(())
    }

    async fn dep_remove(&self, id: &str, target: &str) -> Result<(), TrackerError> {
        self.run(&["dep", "remove", validated(id)?, validated(target)?]).await?;
        Ok(())
    }

    async fn comment_add(&self, id: &str, text: &str) -> Result<(), TrackerError> {
        self.run(&["comments", "add", validated(id)?, text]).await?;
        Ok(())
    }

    async fn comments_list(&self, id: &str) -> Result<Vec<Comment>, TrackerError> {
        let out = self.run(&["comments", "list", validated(id)?, "--json"]).await?;
        serde_json::from_str(&out).map_err(|e| TrackerError::MalformedOutput(e.to_string()))
    }

    async fn list(&self, label: &str, status: &str) -> Result<Vec<TaskView>, TrackerError> {
        let out = self.run(&["list", "--label", label, "--status", status, "--json"]).await?;
        serde_json::from_str(&out).map_err(|e| TrackerError::MalformedOutput(e.to_string()))
    }

    async fn show(&self, id: &str) -> Result<TaskView, TrackerError> {
        let out = self.run(&["show", validated(id)?, "--json"]).await?;
        serde_json::from_str(&out).map_err(|e| TrackerError::MalformedOutput(e.to_string()))
    }

    async fn sync(&self) -> Result<(), TrackerError> {
        self.run(&["sync", "--flush-only"]).await?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct State {
        tasks: HashMap<String, TaskView>,
        comments: HashMap<String, Vec<Comment>>,
        next_id: u64,
        sync_count: u64,
    }

    /// In-memory issue tracker for the workspace's test suites.
    pub struct FakeIssueTracker {
        state: Mutex<State>,
        now: Box<dyn Fn() -> u64 + Send + Sync>,
    }

    impl FakeIssueTracker {
        pub fn new(now: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
            Self { state: Mutex::new(State::default()), now: Box::new(now) }
        }

        pub fn seed_task(&self, id: &str, labels: &[&str], priority: i64) {
            let mut state = self.state.lock();
            state.tasks.insert(
                id.to_string(),
                TaskView {
                    id: id.to_string(),
                    labels: labels.iter().map(|s| s.to_string()).collect(),
                    status: "open".to_string(),
                    priority,
                    description: String::new(),
                },
            );
        }

        pub fn sync_count(&self) -> u64 {
            self.state.lock().sync_count
        }
    }

    #[async_trait]
    impl IssueTrackerCli for FakeIssueTracker {
        async fn create(&self, description: &str, labels: &[String]) -> Result<String, TrackerError> {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("task-{}", state.next_id);
            state.tasks.insert(
                id.clone(),
                TaskView { id: id.clone(), labels: labels.to_vec(), status: "open".into(), priority: 0, description: description.into() },
            );
            Ok(id)
        }

        async fn update(&self, id: &str, description: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(id).ok_or_else(|| TrackerError::CommandFailed(id.into()))?;
            task.description = description.to_string();
            Ok(())
        }

        async fn close(&self, id: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(id).ok_or_else(|| TrackerError::CommandFailed(id.into()))?;
            task.status = "closed".into();
            Ok(())
        }

        async fn reopen(&self, id: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(id).ok_or_else(|| TrackerError::CommandFailed(id.into()))?;
            task.status = "open".into();
            Ok(())
        }

        async fn label_add(&self, id: &str, label: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(id).ok_or_else(|| TrackerError::CommandFailed(id.into()))?;
            if !task.labels.iter().any(|l| l == label) {
                task.labels.push(label.to_string());
            }
            Ok(())
        }

        async fn label_remove(&self, id: &str, label: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            let task = state.tasks.get_mut(id).ok_or_else(|| TrackerError::CommandFailed(id.into()))?;
            task.labels.retain(|l| l != label);
            Ok(())
        }

        async fn dep_add(&self, id: &str, _target: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            Ok(())
        }

        async fn dep_remove(&self, id: &str, _target: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            Ok(())
        }

        async fn comment_add(&self, id: &str, text: &str) -> Result<(), TrackerError> {
            check_id(id)?;
            let mut state = self.state.lock();
            if !state.tasks.contains_key(id) {
                return Err(TrackerError::CommandFailed(id.into()));
            }
            let now = (self.now)();
            state
                .comments
                .entry(id.to_string())
                .or_default()
                .push(Comment { author: "kernel".into(), body: text.to_string(), created_at: now });
            Ok(())
        }

        async fn comments_list(&self, id: &str) -> Result<Vec<Comment>, TrackerError> {
            check_id(id)?;
            Ok(self.state.lock().comments.get(id).cloned().unwrap_or_default())
        }

        async fn list(&self, label: &str, status: &str) -> Result<Vec<TaskView>, TrackerError> {
            let state = self.state.lock();
            let mut out: Vec<TaskView> = state
                .tasks
                .values()
                .filter(|t| (label.is_empty() || t.labels.iter().any(|l| l == label)) && (status.is_empty() || t.status == status))
                .cloned()
                .collect();
            out.sort_by_key(|t| t.priority);
            Ok(out)
        }

        async fn show(&self, id: &str) -> Result<TaskView, TrackerError> {
            check_id(id)?;
            self.state.lock().tasks.get(id).cloned().ok_or_else(|| TrackerError::CommandFailed(id.into()))
        }

        async fn sync(&self) -> Result<(), TrackerError> {
            self.state.lock().sync_count += 1;
            Ok(())
        }
    }
}
