//! Step runner — one step, one tool, retried under its policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use tools::ToolExecutor;

use crate::interpolate::interpolate;
use crate::models::{StepDefinition, StepExecution, StepState};
use crate::EngineError;

/// Executes single steps through the injected [`ToolExecutor`].
pub struct StepRunner {
    executor: Arc<dyn ToolExecutor>,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    /// Interpolate the step's args against `scope` and call its tool.
    ///
    /// Failed attempts are retried up to `retryPolicy.maxAttempts` with a fixed
    /// `backoffMs` pause between them.  The returned record is `COMPLETED` or
    /// `FAILED`; whether a failure aborts the run is the engine's call (see
    /// [`escalation`]).
    #[instrument(skip_all, fields(step_id = %step.id, tool = %step.tool))]
    pub async fn run_step(&self, step: &StepDefinition, scope: &Value) -> StepExecution {
        let policy = step.effective_retry_policy();
        let max_attempts = policy.max_attempts.max(1);
        let backoff = Duration::from_millis(policy.backoff_ms);
        let args = interpolate(&step.args, scope);

        let mut record = StepExecution {
            state: StepState::Running,
            started_at: Some(Utc::now()),
            ..StepExecution::pending(&step.id)
        };

        loop {
            record.attempts += 1;
            debug!(attempt = record.attempts, max_attempts, "calling tool");

            match self.executor.execute(&step.tool, args.clone()).await {
                Ok(result) => {
                    record.state = StepState::Completed;
                    record.result = Some(result);
                    record.error = None;
                    record.completed_at = Some(Utc::now());
                    return record;
                }
                Err(err) if record.attempts < max_attempts => {
                    warn!(
                        "step '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        step.id, record.attempts, max_attempts, backoff, err
                    );
                    record.error = Some(err.to_string());
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(err) => {
                    warn!(
                        "step '{}' failed after {} attempt(s): {}",
                        step.id, record.attempts, err
                    );
                    record.state = StepState::Failed;
                    record.error = Some(err.to_string());
                    record.completed_at = Some(Utc::now());
                    return record;
                }
            }
        }
    }
}

/// The error that aborts the run, if this finished step demands one.
///
/// `None` for successes and for failures of `continueOnError` steps.
pub fn escalation(step: &StepDefinition, record: &StepExecution) -> Option<EngineError> {
    (record.state == StepState::Failed && !step.continue_on_error).then(|| {
        EngineError::StepExecutionFailed {
            step_id: step.id.clone(),
            attempts: record.attempts,
            message: record.error.clone().unwrap_or_default(),
        }
    })
}
