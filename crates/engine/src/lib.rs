//! `engine` crate — workflow models, dependency scheduling, step execution,
//! compensating rollback, and the execution engine that ties them together.

pub mod models;
pub mod error;
pub mod interpolate;
pub mod dag;
pub mod runner;
pub mod rollback;
pub mod registry;
pub mod executor;

pub use models::{
    Execution, ExecutionFilter, RetryPolicy, RollbackAction, RollbackStrategy, StepDefinition,
    StepExecution, StepState, WorkflowDefinition, WorkflowState,
};
pub use error::EngineError;
pub use dag::{compute_ready_sets, validate_definition, DependencyGraph};
pub use interpolate::interpolate;
pub use executor::{EngineConfig, WorkflowEngine};

#[cfg(test)]
mod executor_tests;
