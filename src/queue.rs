//! Per-queue operations over the broker.
//!
//! Every queue has two lists: `execution` (pending, FIFO) and `unhandled`
//! (aborted or orphaned work awaiting an operator). Executions popped by a
//! worker are also recorded in one shared active set until they complete.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::Broker;
use crate::endpoints;
use crate::error::BrokerError;
use crate::messages::{ProcedureExecution, QueueBucket, QueueNotification, WorkerStatusMessage};

/// Thin wrapper translating queue operations into broker primitives.
#[derive(Clone)]
pub struct ExecutionQueueHelper {
    broker: Arc<dyn Broker>,
}

impl ExecutionQueueHelper {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    // ── Execution lists ─────────────────────────────────────────────

    /// Append an execution to the tail of its queue.
    pub async fn push(&self, queue: &str, execution: &ProcedureExecution) -> Result<(), BrokerError> {
        self.broker
            .push(&endpoints::execution_list(queue), &execution.to_json()?)
            .await
    }

    /// Pop the next execution, waiting up to `timeout`.
    pub async fn pop(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<ProcedureExecution>, BrokerError> {
        let raw = self
            .broker
            .blocking_pop(&endpoints::execution_list(queue), timeout)
            .await?;
        raw.map(|r| decode(&r)).transpose()
    }

    /// Pop the next execution and mark it active until
    /// [`remove_from_active_set`](Self::remove_from_active_set) is called.
    pub async fn pop_to_active_set(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<ProcedureExecution>, BrokerError> {
        let raw = self
            .broker
            .blocking_pop_to_set(
                &endpoints::execution_list(queue),
                endpoints::ACTIVE_EXECUTIONS,
                timeout,
            )
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        match ProcedureExecution::from_json(&raw) {
            Ok(execution) => Ok(Some(execution)),
            Err(e) => {
                // Nobody can ever complete an undecodable item; don't leave it marked active.
                self.broker.set_remove(endpoints::ACTIVE_EXECUTIONS, &raw).await?;
                Err(e.into())
            }
        }
    }

    /// Pending executions, head first.
    pub async fn pending(&self, queue: &str) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.decode_list(&endpoints::execution_list(queue)).await
    }

    /// Remove a specific pending execution. Returns whether it was still queued.
    pub async fn remove_pending(&self, execution: &ProcedureExecution) -> Result<bool, BrokerError> {
        let list = endpoints::execution_list(&execution.queue);
        let mut removed = 0;
        for raw in self.broker.list_range(&list).await? {
            if matches_id(&raw, &execution.execution_id) {
                removed += self.broker.list_remove(&list, &raw).await?;
            }
        }
        Ok(removed > 0)
    }

    // ── Unhandled lists ─────────────────────────────────────────────

    pub async fn unhandled(&self, queue: &str) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.decode_list(&endpoints::unhandled_list(queue)).await
    }

    pub async fn push_unhandled(
        &self,
        queue: &str,
        execution: &ProcedureExecution,
    ) -> Result<(), BrokerError> {
        self.broker
            .push(&endpoints::unhandled_list(queue), &execution.to_json()?)
            .await
    }

    /// Move every pending execution of `queue` to its unhandled list.
    pub async fn move_queue_to_unhandled(&self, queue: &str) -> Result<usize, BrokerError> {
        let moved = self
            .broker
            .move_list(&endpoints::execution_list(queue), &endpoints::unhandled_list(queue))
            .await?;
        if moved > 0 {
            debug!(queue, moved, "Moved pending executions to unhandled");
        }
        Ok(moved)
    }

    /// Move the pending executions of every queue to unhandled. Returns the
    /// queues that had anything to move.
    pub async fn move_all_to_unhandled(&self) -> Result<Vec<String>, BrokerError> {
        let mut affected = Vec::new();
        for queue in self.pending_queue_names().await? {
            if self.move_queue_to_unhandled(&queue).await? > 0 {
                affected.push(queue);
            }
        }
        Ok(affected)
    }

    /// Move active-set members (all, or only those of `queue`) to the
    /// unhandled list of their own queue. Returns the queues touched.
    pub async fn move_active_to_unhandled(
        &self,
        queue: Option<&str>,
    ) -> Result<Vec<String>, BrokerError> {
        let mut affected = BTreeSet::new();
        for raw in self.broker.set_members(endpoints::ACTIVE_EXECUTIONS).await? {
            let execution = match ProcedureExecution::from_json(&raw) {
                Ok(execution) => execution,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable active execution");
                    self.broker.set_remove(endpoints::ACTIVE_EXECUTIONS, &raw).await?;
                    continue;
                }
            };
            if queue.is_some_and(|q| q != execution.queue) {
                continue;
            }
            if self.broker.set_remove(endpoints::ACTIVE_EXECUTIONS, &raw).await? {
                self.broker
                    .push(&endpoints::unhandled_list(&execution.queue), &raw)
                    .await?;
                affected.insert(execution.queue);
            }
        }
        Ok(affected.into_iter().collect())
    }

    /// Active executions, optionally filtered to one queue.
    pub async fn active(&self, queue: Option<&str>) -> Result<Vec<ProcedureExecution>, BrokerError> {
        let mut active = Vec::new();
        for raw in self.broker.set_members(endpoints::ACTIVE_EXECUTIONS).await? {
            match ProcedureExecution::from_json(&raw) {
                Ok(execution) if queue.is_none_or(|q| q == execution.queue) => active.push(execution),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping undecodable active execution"),
            }
        }
        Ok(active)
    }

    /// Mark an execution as no longer in flight.
    pub async fn remove_from_active_set(
        &self,
        execution: &ProcedureExecution,
    ) -> Result<bool, BrokerError> {
        let mut removed = false;
        for raw in self.broker.set_members(endpoints::ACTIVE_EXECUTIONS).await? {
            if matches_id(&raw, &execution.execution_id) {
                removed |= self.broker.set_remove(endpoints::ACTIVE_EXECUTIONS, &raw).await?;
            }
        }
        Ok(removed)
    }

    // ── Clearing ────────────────────────────────────────────────────

    pub async fn clear_unhandled_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.broker.delete(&endpoints::unhandled_list(queue)).await
    }

    /// Clear every unhandled list. Returns the queues that were cleared.
    pub async fn clear_all_unhandled(&self) -> Result<Vec<String>, BrokerError> {
        let queues = self.unhandled_queue_names().await?;
        for queue in &queues {
            self.clear_unhandled_queue(queue).await?;
        }
        Ok(queues)
    }

    /// Remove one execution from whichever unhandled list holds it. Returns
    /// its queue if found.
    pub async fn clear_unhandled_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<String>, BrokerError> {
        let mut found = None;
        for queue in self.unhandled_queue_names().await? {
            let list = endpoints::unhandled_list(&queue);
            for raw in self.broker.list_range(&list).await? {
                if matches_id(&raw, execution_id) && self.broker.list_remove(&list, &raw).await? > 0 {
                    found = Some(queue.clone());
                }
            }
        }
        Ok(found)
    }

    // ── Discovery ───────────────────────────────────────────────────

    /// Queues with a non-empty execution list.
    pub async fn pending_queue_names(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .broker
            .keys_with_prefix(endpoints::EXECUTION_PREFIX)
            .await?
            .iter()
            .filter_map(|key| endpoints::queue_from_execution_key(key))
            .map(str::to_string)
            .collect())
    }

    /// Queues with pending or active executions.
    pub async fn active_and_pending_queue_names(&self) -> Result<Vec<String>, BrokerError> {
        let mut names: BTreeSet<String> = self.pending_queue_names().await?.into_iter().collect();
        names.extend(self.active(None).await?.into_iter().map(|e| e.queue));
        Ok(names.into_iter().collect())
    }

    /// Queues with a non-empty unhandled list.
    pub async fn unhandled_queue_names(&self) -> Result<Vec<String>, BrokerError> {
        Ok(self
            .broker
            .keys_with_prefix(endpoints::UNHANDLED_PREFIX)
            .await?
            .iter()
            .filter_map(|key| endpoints::queue_from_unhandled_key(key))
            .map(str::to_string)
            .collect())
    }

    // ── Worker status ───────────────────────────────────────────────

    pub async fn push_status(&self, message: &WorkerStatusMessage) -> Result<(), BrokerError> {
        self.broker
            .push(
                &endpoints::worker_status_list(&message.worker_queue),
                &serde_json::to_string(message)?,
            )
            .await
    }

    /// Pop the raw next status update for `queue`. Decoding is left to the
    /// caller so it can treat garbage as a protocol error.
    pub async fn pop_status_raw(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrokerError> {
        self.broker
            .blocking_pop(&endpoints::worker_status_list(queue), timeout)
            .await
    }

    pub async fn clear_status(&self, queue: &str) -> Result<(), BrokerError> {
        self.broker.delete(&endpoints::worker_status_list(queue)).await
    }

    // ── Watchers and catalogue ──────────────────────────────────────

    /// Tell observers that a queue's list changed.
    pub async fn notify_watchers(&self, queue: &str, bucket: QueueBucket) -> Result<(), BrokerError> {
        let notification = QueueNotification {
            queue: queue.to_string(),
            bucket,
        };
        self.broker
            .publish(
                endpoints::PROCEDURE_QUEUE_NOTIFICATION,
                &serde_json::to_string(&notification)?,
            )
            .await
    }

    pub async fn publish_available(&self, identifiers: &[String]) -> Result<(), BrokerError> {
        self.broker
            .set_value(endpoints::PROCEDURE_AVAILABLE, &serde_json::to_string(identifiers)?)
            .await
    }

    pub async fn available(&self) -> Result<Vec<String>, BrokerError> {
        match self.broker.get_value(endpoints::PROCEDURE_AVAILABLE).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn decode_list(&self, list: &str) -> Result<Vec<ProcedureExecution>, BrokerError> {
        self.broker
            .list_range(list)
            .await?
            .iter()
            .map(|raw| decode(raw))
            .collect()
    }
}

fn decode(raw: &str) -> Result<ProcedureExecution, BrokerError> {
    Ok(ProcedureExecution::from_json(raw)?)
}

fn matches_id(raw: &str, execution_id: &str) -> bool {
    ProcedureExecution::from_json(raw).is_ok_and(|e| e.execution_id == execution_id)
}
