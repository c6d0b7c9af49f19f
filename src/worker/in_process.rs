//! Worker that runs procedures as tasks inside the manager process.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use tracing::{debug, info};

use super::base::{ProcedureWorker, WorkerCore, WorkerFactory};
use crate::error::WorkerError;
use crate::messages::ProcedureExecution;
use crate::procedures::ProcedureRegistry;
use crate::queue::ExecutionQueueHelper;

/// The execution currently running and the handle that cancels it.
struct Current {
    execution_id: String,
    handle: AbortHandle,
}

pub struct InProcessWorker {
    core: WorkerCore,
    registry: Arc<ProcedureRegistry>,
    current: Mutex<Option<Current>>,
}

impl InProcessWorker {
    pub fn new(core: WorkerCore, registry: Arc<ProcedureRegistry>) -> Self {
        Self {
            core,
            registry,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Current>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Id of the execution in progress, if any.
    pub fn running_execution(&self) -> Option<String> {
        self.current().as_ref().map(|c| c.execution_id.clone())
    }

    fn cancel_current(&self) -> Option<String> {
        let current = self.current().take()?;
        current.handle.abort();
        Some(current.execution_id)
    }
}

#[async_trait]
impl ProcedureWorker for InProcessWorker {
    fn core(&self) -> &WorkerCore {
        &self.core
    }

    async fn setup_execution_environment(&self) -> Result<(), WorkerError> {
        debug!(queue = %self.core.queue(), "In-process worker ready");
        Ok(())
    }

    async fn run_task(&self, execution: &ProcedureExecution) -> Result<(), WorkerError> {
        let (handle, registration) = AbortHandle::new_pair();
        *self.current() = Some(Current {
            execution_id: execution.execution_id.clone(),
            handle,
        });

        let outcome = Abortable::new(self.registry.run(execution), registration).await;

        let mut current = self.current();
        if current
            .as_ref()
            .is_some_and(|c| c.execution_id == execution.execution_id)
        {
            *current = None;
        }
        drop(current);

        match outcome {
            Ok(Ok(value)) => {
                debug!(execution_id = %execution.execution_id, result = %value, "Procedure returned");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_aborted) => Err(WorkerError::ExecutionAborted {
                queue: self.core.queue().to_string(),
                execution_id: execution.execution_id.clone(),
            }),
        }
    }

    async fn abort(&self) {
        self.core.request_stop();
        if let Some(execution_id) = self.cancel_current() {
            info!(queue = %self.core.queue(), execution_id = %execution_id, "Aborted running execution");
        }
    }

    async fn abort_execution(&self, execution_id: &str) {
        let mut current = self.current();
        if let Some(running) = current.as_ref()
            && running.execution_id == execution_id
        {
            running.handle.abort();
            *current = None;
            info!(queue = %self.core.queue(), execution_id, "Aborted execution");
        }
    }

    async fn kill_process(&self) {
        self.core.request_stop();
        self.cancel_current();
    }
}

/// Creates [`InProcessWorker`]s sharing one registry.
pub struct InProcessWorkerFactory {
    registry: Arc<ProcedureRegistry>,
}

impl InProcessWorkerFactory {
    pub fn new(registry: Arc<ProcedureRegistry>) -> Self {
        Self { registry }
    }
}

impl WorkerFactory for InProcessWorkerFactory {
    fn create(
        &self,
        queue: &str,
        helper: ExecutionQueueHelper,
        lifetime: Duration,
    ) -> Arc<dyn ProcedureWorker> {
        Arc::new(InProcessWorker::new(
            WorkerCore::new(queue, helper, lifetime),
            Arc::clone(&self.registry),
        ))
    }
}
