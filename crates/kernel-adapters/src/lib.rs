// SPDX-License-Identifier: MIT

//! External-collaborator adapters: every capability this workspace needs
//! from something outside its own process — an issue-tracker CLI, a
//! periodic-job scheduler, an agent child process, a restore source — is
//! reached through a trait defined here, with a `test-support`-gated fake
//! alongside the real implementation.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod agent_session;
pub mod issue_tracker;
pub mod manifest_source;
pub mod scheduler;

pub use agent_session::{AgentSessionSpawner, SessionOutcome, SpawnError, SubprocessAgentSpawner};
pub use issue_tracker::{Comment, IssueTrackerCli, SubprocessIssueTrackerCli, TaskView, TrackerError};
pub use manifest_source::{ManifestSource, MountSource, RestoreError, TemplateSource, VcsSource};
pub use scheduler::{PeriodicJob, Scheduler, TokioScheduler};
