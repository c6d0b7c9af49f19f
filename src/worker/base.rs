//! Procedure worker contract.
//!
//! A worker owns exactly one queue for its lifetime:
//!
//! ```text
//! created → setup → IDLE ⇄ RUNNING → FINISHED
//!                 (DEAD from anywhere, assigned by the host)
//! ```
//!
//! Workers are scoped resources. [`run_scoped`] guarantees `kill_process`
//! runs on every exit path, including cancellation of the task driving it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::status::{StatusHistory, StatusTransition, WorkerStatus};
use crate::error::WorkerError;
use crate::messages::ProcedureExecution;
use crate::queue::ExecutionQueueHelper;

/// State shared by every worker implementation.
pub struct WorkerCore {
    queue: String,
    helper: ExecutionQueueHelper,
    lifetime: Duration,
    status: watch::Sender<Option<WorkerStatus>>,
    history: Mutex<StatusHistory>,
    stop: watch::Sender<bool>,
}

impl WorkerCore {
    pub fn new(queue: impl Into<String>, helper: ExecutionQueueHelper, lifetime: Duration) -> Self {
        Self {
            queue: queue.into(),
            helper,
            lifetime,
            status: watch::Sender::new(None),
            history: Mutex::new(StatusHistory::default()),
            stop: watch::Sender::new(false),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn helper(&self) -> &ExecutionQueueHelper {
        &self.helper
    }

    /// Idle time after which the worker exits.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Latest status, `None` until the worker first reports.
    pub fn status(&self) -> Option<WorkerStatus> {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<Option<WorkerStatus>> {
        self.status.subscribe()
    }

    fn history(&self) -> MutexGuard<'_, StatusHistory> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status_history(&self) -> Vec<StatusTransition> {
        self.history().transitions()
    }

    /// Statuses passed through so far, oldest first.
    pub fn status_sequence(&self) -> Vec<WorkerStatus> {
        self.history().sequence()
    }

    pub fn set_status(&self, status: WorkerStatus) {
        let valid = self.history().record(status);
        if !valid {
            warn!(queue = %self.queue, status = %status, "Unexpected worker status transition");
        }
        debug!(queue = %self.queue, status = %status, "Worker status");
        self.status.send_replace(Some(status));
    }

    /// Report `FINISHED` unless a terminal status was already reported.
    pub fn finish_if_live(&self) {
        if !self.status().is_some_and(|s| s.is_terminal()) {
            self.set_status(WorkerStatus::Finished);
        }
    }

    /// Ask the work loop to stop at its next suspension point.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`request_stop`](Self::request_stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

/// A worker draining one queue.
#[async_trait]
pub trait ProcedureWorker: Send + Sync {
    fn core(&self) -> &WorkerCore;

    fn queue(&self) -> &str {
        self.core().queue()
    }

    fn status(&self) -> Option<WorkerStatus> {
        self.core().status()
    }

    /// Prepare the process or container. Called once per lifetime.
    async fn setup_execution_environment(&self) -> Result<(), WorkerError>;

    /// Drain the queue until it stays empty for the worker lifetime or the
    /// worker is aborted. Reports `FINISHED` on every exit path.
    async fn work(&self) -> Result<(), WorkerError> {
        let core = self.core();
        core.set_status(WorkerStatus::Idle);

        let result = loop {
            if core.stop_requested() {
                break Ok(());
            }
            let popped = tokio::select! {
                popped = core.helper().pop_to_active_set(core.queue(), core.lifetime()) => popped,
                () = core.stopped() => break Ok(()),
            };
            let execution = match popped {
                Ok(Some(execution)) => execution,
                Ok(None) => {
                    debug!(queue = %core.queue(), "Queue idle, worker exiting");
                    break Ok(());
                }
                Err(e) => break Err(WorkerError::from(e)),
            };

            core.set_status(WorkerStatus::Running);
            let outcome = self.run_task(&execution).await;
            match &outcome {
                Ok(()) => info!(
                    queue = %core.queue(),
                    execution_id = %execution.execution_id,
                    identifier = %execution.identifier,
                    "Procedure execution finished"
                ),
                Err(e) => warn!(
                    queue = %core.queue(),
                    execution_id = %execution.execution_id,
                    error = %e,
                    "Procedure execution failed"
                ),
            }
            // Interrupted by a worker abort: leave it active so cleanup
            // surfaces it as unhandled.
            let interrupted = core.stop_requested()
                && matches!(outcome, Err(WorkerError::ExecutionAborted { .. }));
            if !interrupted
                && let Err(e) = core.helper().remove_from_active_set(&execution).await
            {
                warn!(queue = %core.queue(), error = %e, "Failed to clear active execution");
            }
            core.set_status(WorkerStatus::Idle);
        };

        core.set_status(WorkerStatus::Finished);
        result
    }

    /// Execute one popped item.
    async fn run_task(&self, execution: &ProcedureExecution) -> Result<(), WorkerError>;

    /// Stop the worker as soon as possible.
    async fn abort(&self);

    /// Abort `execution_id` if this worker is the one running it.
    async fn abort_execution(&self, execution_id: &str);

    /// Forcefully release the process or container. Idempotent.
    async fn kill_process(&self);

    /// Record the final status when the task driving this worker was
    /// cancelled before `work` returned.
    fn cancelled(&self) {
        self.core().finish_if_live();
    }
}

/// Builds the worker for a queue.
pub trait WorkerFactory: Send + Sync {
    fn create(
        &self,
        queue: &str,
        helper: ExecutionQueueHelper,
        lifetime: Duration,
    ) -> Arc<dyn ProcedureWorker>;
}

/// Kills the worker's process when dropped, unless released first.
struct KillGuard {
    worker: Option<Arc<dyn ProcedureWorker>>,
}

impl KillGuard {
    async fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.kill_process().await;
        }
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.cancelled();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { worker.kill_process().await });
            }
            Err(_) => warn!(queue = %worker.queue(), "No runtime to kill cancelled worker"),
        }
    }
}

/// Set up the worker, run it to completion, then kill its process.
pub async fn run_scoped(worker: Arc<dyn ProcedureWorker>) -> Result<(), WorkerError> {
    let guard = KillGuard {
        worker: Some(Arc::clone(&worker)),
    };
    let result = match worker.setup_execution_environment().await {
        Ok(()) => worker.work().await,
        Err(e) => Err(e),
    };
    worker.core().finish_if_live();
    guard.release().await;
    result
}
