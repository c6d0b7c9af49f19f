//! Procedure registry, mapping identifiers to executable bodies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::messages::{ArgsKwargs, ProcedureExecution};

/// A named server-side operation.
#[async_trait]
pub trait Procedure: Send + Sync + std::fmt::Debug {
    /// Identifier clients request this procedure by.
    fn identifier(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run the procedure for one execution.
    async fn run(
        &self,
        execution: &ProcedureExecution,
        args: &ArgsKwargs,
    ) -> Result<Value, RegistryError>;
}

/// Registry of available procedures.
pub struct ProcedureRegistry {
    procedures: RwLock<HashMap<String, Arc<dyn Procedure>>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        Self {
            procedures: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the builtin procedures.
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        for procedure in super::builtin::all() {
            // Builtin identifiers are distinct, so registration cannot collide.
            if let Err(e) = registry.register(procedure).await {
                tracing::warn!(error = %e, "Skipping builtin procedure");
            }
        }
        registry
    }

    /// Register a procedure. Identifiers are unique; a second registration
    /// under the same identifier is rejected.
    pub async fn register(&self, procedure: Arc<dyn Procedure>) -> Result<(), RegistryError> {
        let identifier = procedure.identifier().to_string();
        let mut procedures = self.procedures.write().await;
        if procedures.contains_key(&identifier) {
            return Err(RegistryError::AlreadyRegistered(identifier));
        }
        procedures.insert(identifier.clone(), procedure);
        tracing::debug!(identifier = %identifier, "Registered procedure");
        Ok(())
    }

    pub async fn unregister(&self, identifier: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.write().await.remove(identifier)
    }

    pub async fn get(&self, identifier: &str) -> Option<Arc<dyn Procedure>> {
        self.procedures.read().await.get(identifier).cloned()
    }

    pub async fn has(&self, identifier: &str) -> bool {
        self.procedures.read().await.contains_key(identifier)
    }

    /// All registered identifiers, sorted.
    pub async fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up and run the procedure an execution names.
    pub async fn run(&self, execution: &ProcedureExecution) -> Result<Value, RegistryError> {
        let procedure = self
            .get(&execution.identifier)
            .await
            .ok_or_else(|| RegistryError::NotRegistered(execution.identifier.clone()))?;
        procedure.run(execution, &execution.args_kwargs).await
    }
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
