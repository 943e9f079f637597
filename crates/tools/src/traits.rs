//! The `ToolExecutor` and `Tool` traits — the contract between the engine and
//! the operation layer.

use async_trait::async_trait;
use serde_json::Value;

use crate::ToolExecutionError;

/// A single-call abstraction over whatever concrete operation a step names.
///
/// The engine holds one `Arc<dyn ToolExecutor>` and calls it for both forward
/// steps and compensating rollback actions.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run the operation `tool` with the already-interpolated `args`.
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolExecutionError>;
}

/// One named operation, registered in a [`crate::ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Call the operation with its JSON arguments and return its JSON result.
    async fn call(&self, args: Value) -> Result<Value, ToolExecutionError>;
}
