//! Worker that delegates execution to a container and supervises it.
//!
//! The container runs the `procedure-worker` entrypoint against the same
//! broker and reports its status on `procedure.worker_status.<queue>`. The
//! host side only watches: it adopts each reported status and polls the
//! container state between reports. An exited container is authoritative;
//! if its last report was not `FINISHED` the worker is marked `DEAD`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::base::{ProcedureWorker, WorkerCore, WorkerFactory};
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::status::WorkerStatus;
use crate::config::{ContainerConfig, ContainerWorkerEnv};
use crate::error::{ContainerError, WorkerError};
use crate::messages::{ProcedureExecution, WorkerStatusMessage};
use crate::queue::ExecutionQueueHelper;

/// How long to wait for a status report before re-inspecting the container.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ContainerWorker {
    core: WorkerCore,
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    poll_interval: Duration,
    container_id: Mutex<Option<String>>,
}

impl ContainerWorker {
    pub fn new(core: WorkerCore, runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        Self {
            core,
            runtime,
            config,
            poll_interval: STATUS_POLL_INTERVAL,
            container_id: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Environment handed to the container. Nothing else crosses over.
    pub fn worker_environment(&self) -> ContainerWorkerEnv {
        ContainerWorkerEnv {
            redis_server: self.config.broker_endpoint.clone(),
            queue: self.core.queue().to_string(),
            timeout_s: self.core.lifetime().as_secs().to_string(),
        }
    }

    fn id_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.container_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn container_id(&self) -> Option<String> {
        self.id_slot().clone()
    }

    fn adopt(&self, raw: &str) -> Result<(), WorkerError> {
        let update: WorkerStatusMessage =
            serde_json::from_str(raw).map_err(|_| WorkerError::UnexpectedMessage {
                queue: self.core.queue().to_string(),
                message: raw.to_string(),
            })?;
        info!(
            "Container worker '{}' status update: {}",
            self.core.queue(),
            update.status
        );
        self.core.set_status(update.status);
        Ok(())
    }

    /// Follow status reports until the container stops, then drain what it
    /// left behind.
    async fn supervise(&self, id: &str) -> Result<(), WorkerError> {
        let helper = self.core.helper();
        let queue = self.core.queue();
        while !self.runtime.inspect_state(id).await?.is_stopped() {
            if let Some(raw) = helper.pop_status_raw(queue, self.poll_interval).await? {
                self.adopt(&raw)?;
            }
        }
        while let Some(raw) = helper.pop_status_raw(queue, Duration::ZERO).await? {
            self.adopt(&raw)?;
        }
        Ok(())
    }

    /// Kill the container unless it has already stopped.
    async fn kill_if_running(&self) -> Result<bool, ContainerError> {
        let Some(id) = self.container_id() else {
            return Ok(false);
        };
        if self.runtime.inspect_state(&id).await?.is_stopped() {
            return Ok(false);
        }
        self.runtime.kill(&id).await?;
        Ok(true)
    }
}

#[async_trait]
impl ProcedureWorker for ContainerWorker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    async fn setup_execution_environment(&self) -> Result<(), WorkerError> {
        let queue = self.core.queue();
        // Reports from an earlier container would be misread as ours.
        self.core.helper().clear_status(queue).await?;

        let spec = ContainerSpec {
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            env: self.worker_environment().to_pairs(),
            pod: self.config.pod.clone(),
        };
        let id = self
            .runtime
            .run(&spec)
            .await
            .map_err(|e| WorkerError::SetupFailed {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        info!(queue = %queue, container = %id, image = %spec.image, "Started worker container");
        *self.id_slot() = Some(id);
        Ok(())
    }

    async fn work(&self) -> Result<(), WorkerError> {
        let queue = self.core.queue().to_string();
        let Some(id) = self.container_id() else {
            self.core.set_status(WorkerStatus::Dead);
            return Err(ContainerError::NotStarted(queue).into());
        };

        match self.supervise(&id).await {
            Ok(()) => {
                if self.core.status() != Some(WorkerStatus::Finished) {
                    warn!(
                        queue = %queue,
                        container = %id,
                        last_status = ?self.core.status(),
                        "Container exited without reporting FINISHED"
                    );
                    self.core.set_status(WorkerStatus::Dead);
                }
                Ok(())
            }
            Err(e) => {
                error!(queue = %queue, container = %id, error = %e, "Lost container worker");
                self.core.set_status(WorkerStatus::Dead);
                Err(WorkerError::Lost {
                    queue,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn run_task(&self, execution: &ProcedureExecution) -> Result<(), WorkerError> {
        error!(
            queue = %self.core.queue(),
            execution_id = %execution.execution_id,
            "Container worker asked to run a task on the host"
        );
        Err(WorkerError::UnsupportedOperation {
            queue: self.core.queue().to_string(),
        })
    }

    async fn abort(&self) {
        self.core.request_stop();
        match self.kill_if_running().await {
            Ok(true) => info!(queue = %self.core.queue(), "Killed worker container"),
            Ok(false) => {}
            Err(e) => warn!(queue = %self.core.queue(), error = %e, "Failed to kill worker container"),
        }
    }

    async fn abort_execution(&self, execution_id: &str) {
        // The in-container loop has no per-execution cancel channel.
        debug!(
            queue = %self.core.queue(),
            execution_id,
            "Container worker ignores single-execution abort"
        );
    }

    async fn kill_process(&self) {
        if let Err(e) = self.kill_if_running().await {
            warn!(queue = %self.core.queue(), error = %e, "Failed to kill worker container");
        }
    }

    /// Supervision stopped before the container was seen exiting.
    fn cancelled(&self) {
        if !self.core.status().is_some_and(|s| s.is_terminal()) {
            warn!(queue = %self.core.queue(), "Container supervision cancelled");
            self.core.set_status(WorkerStatus::Dead);
        }
    }
}

/// Creates [`ContainerWorker`]s sharing one runtime.
pub struct ContainerWorkerFactory {
    runtime: Arc<dyn ContainerRuntime>,
    config: ContainerConfig,
    poll_interval: Duration,
}

impl ContainerWorkerFactory {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ContainerConfig) -> Self {
        Self {
            runtime,
            config,
            poll_interval: STATUS_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl WorkerFactory for ContainerWorkerFactory {
    fn create(
        &self,
        queue: &str,
        helper: ExecutionQueueHelper,
        lifetime: Duration,
    ) -> Arc<dyn ProcedureWorker> {
        Arc::new(
            ContainerWorker::new(
                WorkerCore::new(queue, helper, lifetime),
                Arc::clone(&self.runtime),
                self.config.clone(),
            )
            .with_poll_interval(self.poll_interval),
        )
    }
}
