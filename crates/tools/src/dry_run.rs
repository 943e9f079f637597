//! `DryRunExecutor` — accepts every tool call and echoes it back.
//!
//! Used by the CLI `run` command to walk a workflow end-to-end without
//! touching the CDN provider.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::{ToolExecutionError, ToolExecutor};

#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl ToolExecutor for DryRunExecutor {
    async fn execute(&self, tool: &str, args: Value) -> Result<Value, ToolExecutionError> {
        info!(tool, %args, "dry run");
        Ok(json!({ "dryRun": true, "tool": tool, "args": args }))
    }
}
