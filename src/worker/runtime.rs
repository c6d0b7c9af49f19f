//! Container runtime operations used by the container worker.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::ContainerConfig;
use crate::error::ContainerError;

/// Observed container state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Exited,
    Stopped,
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" | "configured" | "initialized" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    /// The container is gone for good.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Exited | Self::Stopped)
    }
}

/// What to start.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub command: String,
    pub env: Vec<(String, String)>,
    pub pod: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container, returning its id.
    async fn run(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn kill(&self, id: &str) -> Result<(), ContainerError>;

    async fn inspect_state(&self, id: &str) -> Result<ContainerState, ContainerError>;
}

/// Drives the `podman` (or `docker`) command line.
pub struct CliRuntime {
    binary: String,
    timeout: Duration,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &ContainerConfig) -> Self {
        Self::new(config.runtime.clone(), config.command_timeout)
    }

    pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(pod) = &spec.pod {
            args.push("--pod".to_string());
            args.push(pod.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.split_whitespace().map(str::to_string));
        args
    }

    /// Run the binary with `args`, returning trimmed stdout.
    async fn exec(&self, args: &[String]) -> Result<String, ContainerError> {
        let verb = args.first().cloned().unwrap_or_default();
        debug!(runtime = %self.binary, ?args, "Container command");

        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| ContainerError::Launch {
            runtime: self.binary.clone(),
            reason: e.to_string(),
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ContainerError::Timeout {
                runtime: self.binary.clone(),
                command: verb.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| ContainerError::Launch {
                runtime: self.binary.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                runtime: self.binary.clone(),
                command: verb,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    async fn run(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let stdout = self.exec(&Self::run_args(spec)).await?;
        // Pulls can print progress before the id; the id is always last.
        Ok(stdout.lines().last().unwrap_or_default().trim().to_string())
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        self.exec(&["kill".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn inspect_state(&self, id: &str) -> Result<ContainerState, ContainerError> {
        let raw = self
            .exec(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Status}}".to_string(),
                id.to_string(),
            ])
            .await?;
        Ok(ContainerState::parse(&raw))
    }
}
