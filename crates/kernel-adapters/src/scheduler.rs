// SPDX-License-Identifier: MIT

//! Scheduler capability (spec.md §4.9: "a scheduler callback registered at
//! boot"; spec.md §9: "Polymorphism ... the scheduler interface" is a
//! one-method capability). The Boot Orchestrator registers periodic jobs
//! (work-queue ticks, stale-session sweeps, breaker window trims) against
//! this trait; the concrete `TokioScheduler` drives them with
//! `tokio::time::interval` tasks tracked for orchestrated shutdown.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub type PeriodicJob = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a job to run every `interval`, starting after the first
    /// tick. Returns immediately; the job runs in the background.
    fn register_periodic(&self, name: &str, interval: Duration, job: PeriodicJob);

    /// Cooperatively stop every registered job, waiting up to `deadline`.
    async fn shutdown(&self, deadline: Duration);
}

/// Tokio-backed scheduler: one spawned task per registered job.
#[derive(Default)]
pub struct TokioScheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn register_periodic(&self, name: &str, interval: Duration, job: PeriodicJob) {
        let name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                tracing::trace!(job = %name, "scheduler tick");
                job().await;
            }
        });
        // Best-effort registration: if shutdown races a registration, the
        // handle is simply dropped (aborting the task) at process exit.
        if let Ok(mut handles) = self.handles.try_lock() {
            handles.push(handle);
        }
    }

    async fn shutdown(&self, deadline: Duration) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        let abort_all = async {
            for handle in &handles {
                handle.abort();
            }
            for handle in handles {
                let _ = handle.await;
            }
        };
        let _ = tokio::time::timeout(deadline, abort_all).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_job_runs_repeatedly() {
        let scheduler = TokioScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        scheduler.register_periodic(
            "test-job",
            Duration::from_millis(10),
            Arc::new(move || {
                let c = c.clone();
                Box::pin(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
        for _ in 0..4 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown(Duration::from_millis(100)).await;
    }
}
