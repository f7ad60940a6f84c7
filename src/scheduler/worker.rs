use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TaskmillError};
use crate::storage::{ClaimedTask, TaskRepo};
use crate::time::now_ms;

/// Executes one claimed task (sleep for the declared duration) and reports
/// the outcome to the repo.
///
/// The repo is authoritative: a `StateConflict` on completion means recovery
/// already requeued or failed the task, and the worker's result is dropped.
/// The worker never touches `remaining_deps`; only the repo does.
#[derive(Clone)]
pub struct Worker {
    repo: TaskRepo,
}

impl Worker {
    pub fn new(repo: TaskRepo) -> Self {
        Self { repo }
    }

    pub async fn run(&self, job: ClaimedTask) {
        let started = now_ms();
        info!(task_id = %job.id, duration_ms = job.duration_ms, "task started");

        match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(Ok(())) => {
                info!(task_id = %job.id, elapsed_ms = now_ms() - started, "task finished");
            }
            Ok(Err(err)) => {
                warn!(task_id = %job.id, error = %err, "task execution failed");
                self.report_failure(&job.id, &err.to_string()).await;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %job.id, panic = %message, "task execution panicked");
                self.report_failure(&job.id, &message).await;
            }
        }
    }

    async fn execute(&self, job: &ClaimedTask) -> Result<()> {
        sleep(Duration::from_millis(job.duration_ms.max(0) as u64)).await;

        match self.repo.mark_completed(&job.id, now_ms()).await {
            Ok(()) => Ok(()),
            Err(TaskmillError::StateConflict { status, .. }) => {
                debug!(
                    task_id = %job.id,
                    status = %status,
                    "completion superseded by recovery; abandoning"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn report_failure(&self, task_id: &str, error: &str) {
        if let Err(report_err) = self
            .repo
            .mark_failed_or_retry(task_id, now_ms(), error)
            .await
        {
            warn!(
                task_id = %task_id,
                error = %report_err,
                "could not record task failure"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}
