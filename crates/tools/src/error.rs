//! Tool-level error type.

use thiserror::Error;

/// Errors returned by [`crate::ToolExecutor::execute`].
///
/// The engine treats every variant the same way: the attempt failed and the
/// step's retry policy decides what happens next.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolExecutionError {
    /// No operation is registered under this name.
    #[error("unknown tool: '{0}'")]
    UnknownTool(String),

    /// The operation rejected its arguments before calling the provider.
    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    /// The operation ran and failed.
    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },
}

impl ToolExecutionError {
    /// Shorthand for [`ToolExecutionError::Failed`].
    pub fn failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}
