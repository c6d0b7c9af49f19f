use std::sync::Arc;

use anyhow::Context;
use procedure_manager::broker::{Broker, MemoryBroker, RedisBroker};
use procedure_manager::config::{ContainerConfig, ProcedureConfig, WorkerKind};
use procedure_manager::manager::ProcedureManager;
use procedure_manager::procedures::ProcedureRegistry;
use procedure_manager::worker::{
    CliRuntime, ContainerWorkerFactory, InProcessWorkerFactory, WorkerFactory,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ProcedureConfig::from_env().context("invalid procedure configuration")?;
    let broker_endpoint =
        std::env::var("PROCEDURE_BROKER").unwrap_or_else(|_| "localhost:6379".to_string());

    eprintln!("Procedure manager v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Broker: {}", broker_endpoint);
    eprintln!("   Workers: {:?} (max {})", config.worker_kind, config.max_workers);
    eprintln!("   Default queue: {}", config.default_queue);

    // ── Broker ──────────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = if broker_endpoint == "memory" {
        if config.worker_kind == WorkerKind::Container {
            anyhow::bail!("the in-memory broker cannot be reached from worker containers");
        }
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(
            RedisBroker::connect(&broker_endpoint)
                .await
                .with_context(|| format!("failed to connect to broker at {broker_endpoint}"))?,
        )
    };

    // ── Workers ─────────────────────────────────────────────────────────
    let registry = Arc::new(ProcedureRegistry::with_builtins().await);
    let factory: Arc<dyn WorkerFactory> = match config.worker_kind {
        WorkerKind::InProcess => Arc::new(InProcessWorkerFactory::new(Arc::clone(&registry))),
        WorkerKind::Container => {
            let container = ContainerConfig::from_env();
            tracing::info!(
                runtime = %container.runtime,
                image = %container.image,
                "Using container workers"
            );
            Arc::new(ContainerWorkerFactory::new(
                Arc::new(CliRuntime::from_config(&container)),
                container,
            ))
        }
    };

    let manager = ProcedureManager::start(config, broker, registry, factory)
        .await
        .context("failed to start procedure manager")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    manager.shutdown().await;
    Ok(())
}
