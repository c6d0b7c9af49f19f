//! Procedure workers.
//!
//! - `status`: worker status machine (IDLE ⇄ RUNNING → FINISHED, DEAD)
//! - `base`: the `ProcedureWorker` contract and scoped execution
//! - `in_process`: runs procedures as tasks in the manager process
//! - `container`: supervises a worker container
//! - `runtime`: container runtime CLI
//! - `entrypoint`: the loop that runs inside the container

pub mod base;
pub mod container;
pub mod entrypoint;
pub mod in_process;
pub mod runtime;
pub mod status;

pub use base::{ProcedureWorker, WorkerCore, WorkerFactory, run_scoped};
pub use container::{ContainerWorker, ContainerWorkerFactory};
pub use entrypoint::run_container_entrypoint;
pub use in_process::{InProcessWorker, InProcessWorkerFactory};
pub use runtime::{CliRuntime, ContainerRuntime, ContainerSpec, ContainerState};
pub use status::{StatusTransition, WorkerStatus};
