//! Builtin procedures available on every manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::registry::Procedure;
use crate::error::RegistryError;
use crate::messages::{ArgsKwargs, ProcedureExecution};

/// Upper bound for the `sleep` procedure.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

pub fn all() -> Vec<Arc<dyn Procedure>> {
    vec![Arc::new(Echo), Arc::new(Sleep), Arc::new(LogExecution)]
}

/// Returns its arguments unchanged.
#[derive(Debug)]
pub struct Echo;

#[async_trait]
impl Procedure for Echo {
    fn identifier(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the arguments it was called with"
    }

    async fn run(
        &self,
        _execution: &ProcedureExecution,
        args: &ArgsKwargs,
    ) -> Result<Value, RegistryError> {
        Ok(json!({ "args": args.args(), "kwargs": args.kwargs() }))
    }
}

/// Sleeps for `seconds` (first positional argument or keyword).
#[derive(Debug)]
pub struct Sleep;

impl Sleep {
    fn duration(args: &ArgsKwargs) -> Result<Duration, RegistryError> {
        let raw = args
            .kwargs()
            .get("seconds")
            .or_else(|| args.args().first())
            .ok_or_else(|| invalid("missing 'seconds'"))?;
        let seconds = raw
            .as_f64()
            .ok_or_else(|| invalid("'seconds' must be a number"))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid("'seconds' must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(seconds.min(MAX_SLEEP.as_secs_f64())))
    }
}

fn invalid(reason: &str) -> RegistryError {
    RegistryError::InvalidArguments {
        identifier: "sleep".to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Procedure for Sleep {
    fn identifier(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for the given number of seconds"
    }

    async fn run(
        &self,
        _execution: &ProcedureExecution,
        args: &ArgsKwargs,
    ) -> Result<Value, RegistryError> {
        let duration = Self::duration(args)?;
        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_s": duration.as_secs_f64() }))
    }
}

/// Logs the execution it was called for.
#[derive(Debug)]
pub struct LogExecution;

#[async_trait]
impl Procedure for LogExecution {
    fn identifier(&self) -> &str {
        "log execution message args"
    }

    fn description(&self) -> &str {
        "Log the execution message and its arguments"
    }

    async fn run(
        &self,
        execution: &ProcedureExecution,
        args: &ArgsKwargs,
    ) -> Result<Value, RegistryError> {
        tracing::info!(
            execution_id = %execution.execution_id,
            queue = %execution.queue,
            args = ?args.args(),
            kwargs = ?args.kwargs(),
            "Procedure execution message"
        );
        Ok(Value::Null)
    }
}
