//! Broker adapters behind one trait.

pub mod memory;
pub mod redis_backend;
pub mod traits;

pub use memory::MemoryBroker;
pub use redis_backend::RedisBroker;
pub use traits::{Broker, Subscription};
