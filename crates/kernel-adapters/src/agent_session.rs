// SPDX-License-Identifier: MIT

//! Agent-session spawner (spec.md §4.9 "Execute": spawn an external agent
//! child process with a hard wall-clock timeout). The agent runtime itself
//! is out of scope (spec.md §1); this crate only owns the process-spawn
//! boundary and the exit-code-to-outcome mapping.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    TimedOut,
    Error { exit_code: Option<i32> },
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait AgentSessionSpawner: Send + Sync {
    async fn spawn(&self, task_id: &str, workdir: &PathBuf, timeout: Duration) -> Result<SessionOutcome, SpawnError>;
}

/// The platform "killed by timeout" exit code used by common wrapper
/// tools (e.g. coreutils' `timeout`), which exit 124 when they had to
/// send the kill signal.
const TIMEOUT_WRAPPER_EXIT_CODE: i32 = 124;

/// Spawns `argv[0]` with `argv[1..]` as the agent process, matching the
/// security invariant in spec.md §4.9: argument vectors only, never a
/// shell string.
pub struct SubprocessAgentSpawner {
    pub argv: Vec<String>,
}

#[async_trait]
impl AgentSessionSpawner for SubprocessAgentSpawner {
    async fn spawn(&self, task_id: &str, workdir: &PathBuf, timeout: Duration) -> Result<SessionOutcome, SpawnError> {
        let Some((program, rest)) = self.argv.split_first() else {
            return Ok(SessionOutcome::Error { exit_code: None });
        };
        let mut command = tokio::process::Command::new(program);
        command.args(rest).arg(task_id).current_dir(workdir);

        let mut child = command.spawn()?;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(classify_exit(status)),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        let _ = nix::sys::signal::kill(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGTERM,
                        );
                    }
                }
                let _ = child.wait().await;
                Ok(SessionOutcome::TimedOut)
            }
        }
    }
}

fn classify_exit(status: std::process::ExitStatus) -> SessionOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            if signal == nix::sys::signal::Signal::SIGTERM as i32 {
                return SessionOutcome::TimedOut;
            }
            return SessionOutcome::Error { exit_code: None };
        }
    }
    match status.code() {
        Some(0) => SessionOutcome::Success,
        Some(TIMEOUT_WRAPPER_EXIT_CODE) => SessionOutcome::TimedOut,
        other => SessionOutcome::Error { exit_code: other },
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    pub struct FakeAgentSessionSpawner {
        pub outcome: Mutex<SessionOutcome>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeAgentSessionSpawner {
        pub fn new(outcome: SessionOutcome) -> Self {
            Self { outcome: Mutex::new(outcome), calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl AgentSessionSpawner for FakeAgentSessionSpawner {
        async fn spawn(&self, task_id: &str, _workdir: &PathBuf, _timeout: Duration) -> Result<SessionOutcome, SpawnError> {
            self.calls.lock().push(task_id.to_string());
            Ok(*self.outcome.lock())
        }
    }
}
