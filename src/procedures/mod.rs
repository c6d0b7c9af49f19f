//! Procedures are the operations workers execute.

pub mod builtin;
pub mod registry;

pub use registry::{Procedure, ProcedureRegistry};
