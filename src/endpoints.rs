//! Broker key and channel names.

/// Channel carrying incoming `ProcedureRequest`s.
pub const PROCEDURE_REQUEST: &str = "procedure.request";
/// Channel carrying `RequestResponse` acknowledgements.
pub const PROCEDURE_REQUEST_RESPONSE: &str = "procedure.request.response";
/// Channel carrying `ProcedureAbort` messages.
pub const PROCEDURE_ABORT: &str = "procedure.abort";
/// Channel carrying `ProcedureClearUnhandled` messages.
pub const PROCEDURE_CLEAR_UNHANDLED: &str = "procedure.clear_unhandled";
/// Channel carrying `QueueNotification`s for watchers.
pub const PROCEDURE_QUEUE_NOTIFICATION: &str = "procedure.queue_notification";
/// Key holding the JSON list of known procedure identifiers.
pub const PROCEDURE_AVAILABLE: &str = "procedure.available";
/// Set of executions currently popped by some worker.
pub const ACTIVE_EXECUTIONS: &str = "procedure.execution.active";

pub const EXECUTION_PREFIX: &str = "procedure.execution.";
pub const UNHANDLED_PREFIX: &str = "procedure.unhandled.";
pub const WORKER_STATUS_PREFIX: &str = "procedure.worker_status.";

/// Queue name reserved because its execution key is the active set.
pub const RESERVED_QUEUE: &str = "active";

/// FIFO list of pending executions for `queue`.
pub fn execution_list(queue: &str) -> String {
    format!("{EXECUTION_PREFIX}{queue}")
}

/// List of executions needing operator attention for `queue`.
pub fn unhandled_list(queue: &str) -> String {
    format!("{UNHANDLED_PREFIX}{queue}")
}

/// List the worker for `queue` pushes status updates to.
pub fn worker_status_list(queue: &str) -> String {
    format!("{WORKER_STATUS_PREFIX}{queue}")
}

/// Recover the queue name from an execution list key. The active set shares
/// the prefix and is not a queue.
pub fn queue_from_execution_key(key: &str) -> Option<&str> {
    if key == ACTIVE_EXECUTIONS {
        return None;
    }
    key.strip_prefix(EXECUTION_PREFIX).filter(|q| !q.is_empty())
}

/// Recover the queue name from an unhandled list key.
pub fn queue_from_unhandled_key(key: &str) -> Option<&str> {
    key.strip_prefix(UNHANDLED_PREFIX).filter(|q| !q.is_empty())
}
