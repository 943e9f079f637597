//! `ToolRegistry` — name-based dispatch from tool names to `Tool` objects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Tool, ToolExecutionError, ToolExecutor};

/// Maps tool names to boxed [`Tool`] implementations.
///
/// Built once at start-up by the outer tool layer and handed to the engine
/// as its [`ToolExecutor`].
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(name.into(), tool);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolExecutionError> {
        let handler = self
            .tools
            .get(tool)
            .ok_or_else(|| ToolExecutionError::UnknownTool(tool.to_owned()))?;

        debug!(tool, "dispatching tool call");
        handler.call(args).await
    }
}
