//! Messages exchanged over the broker.
//!
//! Everything is JSON. Lists store executions as their serialized form, so
//! serialization must be stable: `serde_json::Map` keeps keys sorted and the
//! structs below have a fixed field order.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::endpoints::RESERVED_QUEUE;
use crate::error::RequestError;
use crate::worker::status::WorkerStatus;

static QUEUE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("valid queue name regex"));

/// Positional and keyword arguments, encoded as `[[args...], {kwargs}]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgsKwargs(pub Vec<Value>, pub Map<String, Value>);

impl ArgsKwargs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self(args, kwargs)
    }

    pub fn args(&self) -> &[Value] {
        &self.0
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.1
    }
}

/// A client's request to run a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcedureRequest {
    pub identifier: String,
    #[serde(default)]
    pub args_kwargs: Option<ArgsKwargs>,
    #[serde(default)]
    pub queue: Option<String>,
}

impl ProcedureRequest {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            args_kwargs: None,
            queue: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_args(mut self, args_kwargs: ArgsKwargs) -> Self {
        self.args_kwargs = Some(args_kwargs);
        self
    }

    /// Decode a raw request payload.
    pub fn from_json(payload: &str) -> Result<Self, RequestError> {
        serde_json::from_str(payload).map_err(|e| RequestError::Malformed(e.to_string()))
    }

    /// Structural checks that don't need the registry.
    pub fn validate_shape(&self) -> Result<(), RequestError> {
        if self.identifier.trim().is_empty() {
            return Err(RequestError::Malformed("identifier must not be empty".to_string()));
        }
        if let Some(queue) = &self.queue {
            validate_queue_name(queue)?;
        }
        Ok(())
    }
}

/// Check a queue name is usable as a broker key suffix.
pub fn validate_queue_name(queue: &str) -> Result<(), RequestError> {
    if !QUEUE_NAME.is_match(queue) {
        return Err(RequestError::InvalidQueue {
            queue: queue.to_string(),
            reason: "only letters, digits, '_', '-' and '.' are allowed".to_string(),
        });
    }
    if queue == RESERVED_QUEUE {
        return Err(RequestError::InvalidQueue {
            queue: queue.to_string(),
            reason: "name is reserved".to_string(),
        });
    }
    Ok(())
}

/// One accepted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureExecution {
    pub execution_id: String,
    pub identifier: String,
    pub queue: String,
    #[serde(default)]
    pub args_kwargs: ArgsKwargs,
}

impl ProcedureExecution {
    /// Create an execution with a fresh id.
    pub fn new(identifier: impl Into<String>, queue: impl Into<String>, args_kwargs: ArgsKwargs) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            identifier: identifier.into(),
            queue: queue.into(),
            args_kwargs,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Acknowledgement for a `ProcedureRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResponse {
    pub accepted: bool,
    pub message: String,
}

/// Abort at one or more granularities. Every field that is set is acted on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureAbort {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub abort_all: bool,
}

/// Same shape as [`ProcedureAbort`], applied to the unhandled buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcedureClearUnhandled {
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub abort_all: bool,
}

/// Status update pushed by a running worker (usually from a container).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatusMessage {
    pub worker_queue: String,
    pub status: WorkerStatus,
}

/// Which per-queue list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBucket {
    Execution,
    Unhandled,
}

impl std::fmt::Display for QueueBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "execution"),
            Self::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// Published whenever a queue's execution or unhandled list changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueNotification {
    pub queue: String,
    pub bucket: QueueBucket,
}
