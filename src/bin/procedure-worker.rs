//! Container entrypoint: drains one queue and reports status to the host.

use std::sync::Arc;

use anyhow::Context;
use procedure_manager::broker::RedisBroker;
use procedure_manager::config::ContainerWorkerEnv;
use procedure_manager::procedures::ProcedureRegistry;
use procedure_manager::queue::ExecutionQueueHelper;
use procedure_manager::worker::run_container_entrypoint;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_target(false)
        .init();

    tracing::info!("Container worker starting up");
    let env = ContainerWorkerEnv::from_env()
        .context("missing environment variable needed by container worker")?;
    tracing::debug!(?env, "Container worker environment");

    let broker = RedisBroker::connect(&env.redis_server)
        .await
        .with_context(|| format!("failed to connect to broker at {}", env.redis_server))?;
    let helper = ExecutionQueueHelper::new(Arc::new(broker));
    let registry = Arc::new(ProcedureRegistry::with_builtins().await);

    run_container_entrypoint(helper, registry, &env).await?;
    Ok(())
}
