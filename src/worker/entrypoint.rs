//! In-container worker loop.
//!
//! Runs inside the container started by [`ContainerWorker`](super::container::ContainerWorker)
//! and reports every status change back over the broker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::status::WorkerStatus;
use crate::config::ContainerWorkerEnv;
use crate::error::WorkerError;
use crate::messages::{ProcedureExecution, WorkerStatusMessage};
use crate::procedures::ProcedureRegistry;
use crate::queue::ExecutionQueueHelper;

async fn push_status(
    helper: &ExecutionQueueHelper,
    queue: &str,
    status: WorkerStatus,
) -> Result<(), WorkerError> {
    debug!(queue, status = %status, "Updating container worker status");
    helper
        .push_status(&WorkerStatusMessage {
            worker_queue: queue.to_string(),
            status,
        })
        .await?;
    Ok(())
}

/// Pop and run until the queue stays empty for `timeout`. `held` is the
/// execution currently marked active, if any.
async fn drain_queue(
    helper: &ExecutionQueueHelper,
    registry: &ProcedureRegistry,
    queue: &str,
    timeout: Duration,
    held: &mut Option<ProcedureExecution>,
) -> Result<(), WorkerError> {
    while let Some(execution) = helper.pop_to_active_set(queue, timeout).await? {
        *held = Some(execution.clone());
        push_status(helper, queue, WorkerStatus::Running).await?;

        match registry.run(&execution).await {
            Ok(_) => info!(
                queue,
                execution_id = %execution.execution_id,
                identifier = %execution.identifier,
                "Ran procedure in container"
            ),
            Err(e) => warn!(
                queue,
                execution_id = %execution.execution_id,
                error = %e,
                "Procedure failed in container"
            ),
        }

        helper.remove_from_active_set(&execution).await?;
        *held = None;
        push_status(helper, queue, WorkerStatus::Idle).await?;
    }
    Ok(())
}

/// Body of the `procedure-worker` binary.
pub async fn run_container_entrypoint(
    helper: ExecutionQueueHelper,
    registry: Arc<ProcedureRegistry>,
    env: &ContainerWorkerEnv,
) -> Result<(), WorkerError> {
    let queue = env.queue.as_str();
    let timeout = env.timeout().map_err(|e| WorkerError::SetupFailed {
        queue: queue.to_string(),
        reason: e.to_string(),
    })?;
    info!(queue, timeout_s = timeout.as_secs(), "Container worker waiting for instructions");

    push_status(&helper, queue, WorkerStatus::Idle).await?;

    let mut held = None;
    let result = drain_queue(&helper, &registry, queue, timeout, &mut held).await;
    if let Err(e) = &result {
        error!(queue, error = %e, "Container worker loop failed");
    }

    if let Some(execution) = held
        && let Err(e) = helper.remove_from_active_set(&execution).await
    {
        warn!(queue, error = %e, "Failed to release held execution");
    }

    info!(queue, "Container runner shutting down");
    if let Err(e) = push_status(&helper, queue, WorkerStatus::Finished).await {
        warn!(queue, error = %e, "Failed to report FINISHED");
    }
    result
}
