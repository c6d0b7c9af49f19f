//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default number of simultaneously running workers (one per queue).
pub const MAX_WORKERS: usize = 10;
/// Idle time after which a worker with nothing to do shuts itself down.
pub const QUEUE_TIMEOUT_S: u64 = 10;
/// Bounded wait for workers during abort and shutdown.
pub const MANAGER_SHUTDOWN_TIMEOUT_S: u64 = 2;
/// Queue used when a request does not name one.
pub const DEFAULT_QUEUE: &str = "primary";

/// Which worker implementation the manager spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// Run procedures inside the manager process.
    InProcess,
    /// Run procedures in a container supervised by the manager.
    Container,
}

impl std::str::FromStr for WorkerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_process" | "in-process" | "inprocess" => Ok(Self::InProcess),
            "container" => Ok(Self::Container),
            other => Err(ConfigError::InvalidValue {
                key: "PROCEDURE_WORKER_KIND".to_string(),
                message: format!("unknown worker kind {other:?}"),
            }),
        }
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ProcedureConfig {
    /// Maximum number of workers running at once.
    pub max_workers: usize,
    /// How long a worker waits for new work before shutting down.
    pub queue_timeout: Duration,
    /// Bounded wait for workers to exit on abort and shutdown.
    pub shutdown_timeout: Duration,
    /// Queue used when a request omits one.
    pub default_queue: String,
    /// Worker implementation to spawn.
    pub worker_kind: WorkerKind,
}

impl Default for ProcedureConfig {
    fn default() -> Self {
        Self {
            max_workers: MAX_WORKERS,
            queue_timeout: Duration::from_secs(QUEUE_TIMEOUT_S),
            shutdown_timeout: Duration::from_secs(MANAGER_SHUTDOWN_TIMEOUT_S),
            default_queue: DEFAULT_QUEUE.to_string(),
            worker_kind: WorkerKind::Container,
        }
    }
}

impl ProcedureConfig {
    /// Build config from `PROCEDURE_*` environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_workers: usize = std::env::var("PROCEDURE_MAX_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_workers);
        if max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROCEDURE_MAX_WORKERS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let queue_timeout = std::env::var("PROCEDURE_QUEUE_TIMEOUT_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.queue_timeout);

        let shutdown_timeout = std::env::var("PROCEDURE_SHUTDOWN_TIMEOUT_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        let default_queue =
            std::env::var("PROCEDURE_DEFAULT_QUEUE").unwrap_or(defaults.default_queue);

        let worker_kind = match std::env::var("PROCEDURE_WORKER_KIND") {
            Ok(s) => s.parse()?,
            Err(_) => defaults.worker_kind,
        };

        Ok(Self {
            max_workers,
            queue_timeout,
            shutdown_timeout,
            default_queue,
            worker_kind,
        })
    }
}

/// Container worker configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container CLI to drive (`podman` or `docker`).
    pub runtime: String,
    /// Image holding the `procedure-worker` entrypoint.
    pub image: String,
    /// Command run inside the container.
    pub command: String,
    /// Pod to join, so the container can reach the broker.
    pub pod: Option<String>,
    /// Broker endpoint as seen from inside the container (`host:port`).
    pub broker_endpoint: String,
    /// Upper bound on any single runtime CLI call.
    pub command_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "podman".to_string(),
            image: "procedure-worker:latest".to_string(),
            command: "procedure-worker".to_string(),
            pod: Some("local_procedures".to_string()),
            broker_endpoint: "localhost:6379".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl ContainerConfig {
    /// Build config from `PROCEDURE_CONTAINER_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pod = match std::env::var("PROCEDURE_CONTAINER_POD") {
            Ok(s) if s.trim().is_empty() => None,
            Ok(s) => Some(s),
            Err(_) => defaults.pod,
        };

        Self {
            runtime: std::env::var("PROCEDURE_CONTAINER_RUNTIME").unwrap_or(defaults.runtime),
            image: std::env::var("PROCEDURE_CONTAINER_IMAGE").unwrap_or(defaults.image),
            command: std::env::var("PROCEDURE_CONTAINER_COMMAND").unwrap_or(defaults.command),
            pod,
            broker_endpoint: std::env::var("PROCEDURE_CONTAINER_BROKER")
                .unwrap_or(defaults.broker_endpoint),
            command_timeout: std::env::var("PROCEDURE_CONTAINER_COMMAND_TIMEOUT_S")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.command_timeout),
        }
    }
}

/// Environment handed to a worker container. This is the whole host to
/// container contract; everything else is fetched from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerWorkerEnv {
    pub redis_server: String,
    pub queue: String,
    pub timeout_s: String,
}

impl ContainerWorkerEnv {
    pub const KEYS: [&'static str; 3] = ["redis_server", "queue", "timeout_s"];

    /// The environment as `(name, value)` pairs.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("redis_server".to_string(), self.redis_server.clone()),
            ("queue".to_string(), self.queue.clone()),
            ("timeout_s".to_string(), self.timeout_s.clone()),
        ]
    }

    /// Read the environment inside the container.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));
        Ok(Self {
            redis_server: get("redis_server")?,
            queue: get("queue")?,
            timeout_s: get("timeout_s")?,
        })
    }

    /// Idle timeout as a duration.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        self.timeout_s
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue {
                key: "timeout_s".to_string(),
                message: e.to_string(),
            })
    }
}
