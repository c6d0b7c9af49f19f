//! Error types for the procedure manager.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker transport and encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker command failed: {0}")]
    Command(String),

    #[error("Subscription to {channel} closed")]
    SubscriptionClosed { channel: String },

    #[error("Failed to encode or decode message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

/// Reasons a procedure request is rejected. Always reported through the
/// acknowledgement channel, never to the submitter as a failure.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Procedure {identifier} not known to the server. Available: {available:?}")]
    UnknownProcedure {
        identifier: String,
        available: Vec<String>,
    },

    #[error("Invalid queue name {queue:?}: {reason}")]
    InvalidQueue { queue: String, reason: String },

    #[error("Procedure manager is shutting down")]
    ShuttingDown,
}

/// Procedure registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No registered procedure with identifier {0}")]
    NotRegistered(String),

    #[error("Procedure {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Procedure {identifier} failed: {reason}")]
    ExecutionFailed { identifier: String, reason: String },

    #[error("Invalid arguments for procedure {identifier}: {reason}")]
    InvalidArguments { identifier: String, reason: String },
}

/// Worker lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue {queue} already has an active worker")]
    AlreadyExists { queue: String },

    #[error("Queue {queue} has no worker entry to attach to")]
    NotRegistered { queue: String },

    #[error("Worker setup failed for queue {queue}: {reason}")]
    SetupFailed { queue: String, reason: String },

    #[error("Worker for queue {queue} received unexpected message: {message}")]
    UnexpectedMessage { queue: String, message: String },

    #[error("Worker for queue {queue} cannot run tasks directly")]
    UnsupportedOperation { queue: String },

    #[error("Worker for queue {queue} lost its container: {reason}")]
    Lost { queue: String, reason: String },

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Execution {execution_id} on queue {queue} was aborted")]
    ExecutionAborted { queue: String, execution_id: String },

    #[error("Procedure failed: {0}")]
    Procedure(#[from] RegistryError),

    #[error("Broker error in worker: {0}")]
    Broker(#[from] BrokerError),

    #[error("Container error in worker: {0}")]
    Container(#[from] ContainerError),
}

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Failed to launch {runtime}: {reason}")]
    Launch { runtime: String, reason: String },

    #[error("{runtime} {command} exited with {code:?}: {stderr}")]
    CommandFailed {
        runtime: String,
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{runtime} {command} timed out after {timeout:?}")]
    Timeout {
        runtime: String,
        command: String,
        timeout: Duration,
    },

    #[error("Container {0} has not been started")]
    NotStarted(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
