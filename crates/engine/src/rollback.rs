//! Rollback coordinator — compensating actions after an aborted run.
//!
//! Compensation is best-effort: a failing rollback call is logged and
//! recorded on the execution, and the remaining actions still run.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, instrument};

use tools::ToolExecutor;

use crate::interpolate::interpolate;
use crate::models::{Execution, RollbackStrategy, StepState, WorkflowDefinition};
use crate::EngineError;

pub struct RollbackCoordinator {
    executor: Arc<dyn ToolExecutor>,
}

impl RollbackCoordinator {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    /// Run the compensating actions `strategy` selects.
    ///
    /// - `None`: nothing.
    /// - `Failed`: the rollback of each step in `culprits` (the steps whose
    ///   failure aborted the run).
    /// - `All`: the rollback of every `COMPLETED` step, newest `completedAt`
    ///   first.
    ///
    /// Steps without a rollback definition are skipped.  Each step whose
    /// compensation succeeds is marked `ROLLED_BACK`.  Failed compensations are
    /// appended to `execution.rollback_errors` and returned.
    #[instrument(skip_all, fields(execution_id = %execution.id, strategy = ?strategy))]
    pub async fn rollback(
        &self,
        workflow: &WorkflowDefinition,
        execution: &mut Execution,
        strategy: RollbackStrategy,
        culprits: &[String],
        scope: &Value,
    ) -> Vec<EngineError> {
        let targets: Vec<String> = match strategy {
            RollbackStrategy::None => return Vec::new(),
            RollbackStrategy::Failed => culprits.to_vec(),
            RollbackStrategy::All => {
                let mut completed: Vec<_> = execution
                    .steps
                    .values()
                    .filter(|s| s.state == StepState::Completed)
                    .map(|s| (s.completed_at, s.step_id.clone()))
                    .collect();
                completed.sort_by(|a, b| b.cmp(a));
                completed.into_iter().map(|(_, id)| id).collect()
            }
        };

        let mut failures = Vec::new();

        for step_id in targets {
            let Some(action) = workflow.step(&step_id).and_then(|s| s.rollback.as_ref()) else {
                continue;
            };

            let args = interpolate(&action.args, scope);
            info!(step_id = %step_id, tool = %action.tool, "running compensating action");

            match self.executor.execute(&action.tool, args).await {
                Ok(_) => {
                    if let Some(record) = execution.steps.get_mut(&step_id) {
                        record.state = StepState::RolledBack;
                    }
                }
                Err(err) => {
                    let failure = EngineError::RollbackActionFailed {
                        step_id: step_id.clone(),
                        tool: action.tool.clone(),
                        message: err.to_string(),
                    };
                    error!("{failure}");
                    execution.rollback_errors.push(failure.to_string());
                    failures.push(failure);
                }
            }
        }

        failures
    }
}
