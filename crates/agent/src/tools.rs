use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use helmsman_core::domain::tool::{ToolDescriptor, ToolError, ToolParameters, ToolResult};
use serde_json::Value;
use thiserror::Error;

use crate::context::ExecutionContext;

#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Parameters have already passed schema validation.
    async fn execute(
        &self,
        parameters: &ToolParameters,
        context: &ExecutionContext,
    ) -> Result<ToolResult, ToolError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool `{0}` is already registered")]
    DuplicateName(String),
}

/// Name-keyed tool table. Filled during bootstrap, then shared read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.descriptor().name.clone();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors sorted by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut descriptors =
            self.tools.values().map(|tool| tool.descriptor().clone()).collect::<Vec<_>>();
        descriptors.sort_by(|left, right| left.name.cmp(&right.name));
        descriptors
    }

    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|descriptor| descriptor.name).collect()
    }

    /// Function-calling schemas for the intent resolver. Each call builds
    /// fresh values, so callers may mutate the result freely.
    pub fn to_function_schemas(&self) -> Vec<Value> {
        self.list().iter().map(ToolDescriptor::to_function_schema).collect()
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.tools.clear();
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
