//! Procedure manager: named, queued, asynchronous procedure execution with
//! one supervised worker per queue.

pub mod broker;
pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod manager;
pub mod messages;
pub mod procedures;
pub mod queue;
pub mod worker;

pub use client::ProcedureClient;
pub use error::{Error, Result};
pub use manager::ProcedureManager;
