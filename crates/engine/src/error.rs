//! Engine-level error types.

use thiserror::Error;

use crate::models::WorkflowState;

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    // ------ Validation errors ------

    /// A workflow definition without an id.
    #[error("workflow id must not be empty")]
    EmptyWorkflowId,

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// A step depends on a step ID that isn't declared in the workflow.
    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        step_id: String,
        dependency: String,
    },

    /// `maxAttempts` must be at least 1.
    #[error("step '{0}' has a retry policy with maxAttempts = 0")]
    InvalidRetryPolicy(String),

    // ------ Lookup errors ------

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    // ------ Execution errors ------

    /// The dependency graph is cyclic; no step could be scheduled.
    #[error("deadlock detected: steps {} can never become ready (cyclic dependencies)", .unresolved.join(", "))]
    DeadlockDetected { unresolved: Vec<String> },

    /// A step exhausted its attempts.
    #[error("step '{step_id}' failed after {attempts} attempt(s): {message}")]
    StepExecutionFailed {
        step_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Cannot cancel workflow in state: {0}")]
    CannotCancel(WorkflowState),

    /// Compensating actions are running; the run will end `ROLLED_BACK`.
    #[error("Cannot cancel workflow while rollback is in progress: {0}")]
    RollbackInProgress(String),

    /// A compensating call itself failed.
    #[error("rollback of step '{step_id}' via '{tool}' failed: {message}")]
    RollbackActionFailed {
        step_id: String,
        tool: String,
        message: String,
    },

    /// A spawned step task panicked or was aborted.
    #[error("step task did not complete: {0}")]
    StepTaskAborted(String),

    /// The run exceeded its workflow's `maxDuration`.
    #[error("workflow exceeded maxDuration of {0}ms")]
    Timeout(u64),
}
