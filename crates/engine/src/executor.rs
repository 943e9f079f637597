//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. Looks up the registered definition and creates a `RUNNING` execution.
//! 2. Checks the dependency graph for cycles before any tool is called.
//! 3. Repeatedly takes the next ready set from `DependencyGraph` and runs all
//!    of its steps concurrently through the `StepRunner`.
//! 4. On a non-continuable step failure, hands the execution to the
//!    `RollbackCoordinator` and finalizes it as `ROLLED_BACK` (or `FAILED`
//!    when the workflow's rollback strategy is `none`).
//! 5. Honors cooperative cancellation between ready sets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use tools::ToolExecutor;

use crate::dag::{compute_ready_sets, validate_definition, DependencyGraph};
use crate::models::{
    Execution, ExecutionFilter, RollbackStrategy, StepDefinition, StepExecution, StepState,
    WorkflowDefinition, WorkflowState,
};
use crate::registry::{ExecutionRegistry, WorkflowRegistry};
use crate::rollback::RollbackCoordinator;
use crate::runner::{escalation, StepRunner};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on steps running at once within a ready set.
    /// `None` runs every ready step in parallel.
    pub max_concurrency: Option<usize>,
    /// Treat `WorkflowDefinition::max_duration` as a hard timeout.
    pub enforce_max_duration: bool,
    /// Expose completed step results as `steps.<id>.result` to interpolation.
    pub expose_step_results: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            enforce_max_duration: false,
            expose_step_results: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Run outcome (internal)
// ---------------------------------------------------------------------------

enum Outcome {
    Completed,
    Cancelled,
    /// Ended before any compensation applies (deadlock).
    Failed(EngineError),
    /// A step failure (or timeout) that triggers the rollback strategy.
    Aborted {
        error: EngineError,
        culprits: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Registers workflow definitions, runs executions and tracks their state.
///
/// One engine owns its registries; independent engines in the same process
/// share nothing.  Wrap it in an `Arc` to drive several executions at once.
pub struct WorkflowEngine {
    workflows: WorkflowRegistry,
    executions: ExecutionRegistry,
    runner: Arc<StepRunner>,
    rollback: RollbackCoordinator,
    config: EngineConfig,
    /// Cancellation tokens of running executions, keyed by execution id.
    cancellations: DashMap<String, CancellationToken>,
}

impl WorkflowEngine {
    /// Create an engine that calls `executor` for every step and rollback.
    pub fn new(executor: Arc<dyn ToolExecutor>, config: EngineConfig) -> Self {
        Self {
            workflows: WorkflowRegistry::new(),
            executions: ExecutionRegistry::new(),
            runner: Arc::new(StepRunner::new(Arc::clone(&executor))),
            rollback: RollbackCoordinator::new(executor),
            config,
            cancellations: DashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Workflow registry
    // -----------------------------------------------------------------------

    /// Register `workflow`, overwriting any definition with the same id.
    ///
    /// # Errors
    /// Definition validation errors from [`validate_definition`].  Cyclic
    /// dependencies are accepted here and reported when the workflow runs.
    pub fn register_workflow(&self, workflow: WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(&workflow)?;
        info!(
            workflow_id = %workflow.id,
            version = %workflow.version,
            steps = workflow.steps.len(),
            "workflow registered"
        );
        self.workflows.insert(workflow);
        Ok(())
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(workflow_id)
    }

    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.list()
    }

    // -----------------------------------------------------------------------
    // Execution registry
    // -----------------------------------------------------------------------

    pub fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id)
    }

    pub fn list_executions(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        self.executions.list(filter)
    }

    /// Forget every execution record.
    pub fn clear_executions(&self) {
        self.executions.clear();
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Flip a running execution to `CANCELLED`.
    ///
    /// Cancellation is cooperative: no further steps are scheduled, and tool
    /// calls already in flight run to completion without their results being
    /// recorded.  Steps that were `RUNNING` are marked `FAILED` as interrupted.
    ///
    /// # Errors
    /// - [`EngineError::ExecutionNotFound`] for an unknown id.
    /// - [`EngineError::CannotCancel`] if the execution isn't `RUNNING`.
    /// - [`EngineError::RollbackInProgress`] while compensating actions run.
    pub fn cancel_workflow(&self, execution_id: &str) -> Result<(), EngineError> {
        self.executions
            .update(execution_id, |execution| {
                if execution.state != WorkflowState::Running {
                    return Err(EngineError::CannotCancel(execution.state));
                }
                if execution.rolling_back {
                    return Err(EngineError::RollbackInProgress(execution.id.clone()));
                }
                interrupt_running_steps(execution, "execution cancelled");
                execution.transition(WorkflowState::Cancelled);
                Ok(())
            })
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_owned()))??;

        if let Some(token) = self.cancellations.get(execution_id) {
            token.cancel();
        }
        info!(execution_id, "execution cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run the registered workflow `workflow_id` against `context`.
    ///
    /// Returns the final execution record.  Step failures, deadlocks and
    /// rollbacks are reported through its `state` and `error`, not as `Err`.
    ///
    /// # Errors
    /// [`EngineError::WorkflowNotFound`] if no such workflow is registered.
    #[instrument(skip(self, context))]
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        context: Option<Value>,
    ) -> Result<Execution, EngineError> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_owned()))?;

        let mut execution = Execution::new(&workflow, context.unwrap_or_else(|| json!({})));
        execution.transition(WorkflowState::Running);
        let execution_id = execution.id.clone();
        self.executions.insert(execution);
        info!(execution_id = %execution_id, "execution started");

        // A cycle anywhere in the graph fails the run before any tool call.
        if let Err(deadlock) = compute_ready_sets(&workflow.steps) {
            error!(execution_id = %execution_id, "{deadlock}");
            self.fail(&execution_id, &deadlock);
            return self.snapshot(&execution_id);
        }

        let token = CancellationToken::new();
        self.cancellations.insert(execution_id.clone(), token.clone());

        let outcome = match workflow.max_duration {
            Some(limit_ms) if self.config.enforce_max_duration => {
                let run = self.drive(&workflow, &execution_id, &token);
                match tokio::time::timeout(Duration::from_millis(limit_ms), run).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Aborted {
                        error: EngineError::Timeout(limit_ms),
                        culprits: self
                            .executions
                            .get(&execution_id)
                            .map(|e| running_steps(&e))
                            .unwrap_or_default(),
                    },
                }
            }
            _ => self.drive(&workflow, &execution_id, &token).await,
        };

        self.cancellations.remove(&execution_id);
        self.finalize(&workflow, &execution_id, outcome).await;
        self.snapshot(&execution_id)
    }

    /// The ready-set loop.
    async fn drive(
        &self,
        workflow: &Arc<WorkflowDefinition>,
        execution_id: &str,
        token: &CancellationToken,
    ) -> Outcome {
        let mut graph = DependencyGraph::new(&workflow.steps);
        let semaphore = self
            .config
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        loop {
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let ready = match graph.next_ready_set() {
                Ok(ready) => ready,
                Err(deadlock) => return Outcome::Failed(deadlock),
            };
            if ready.is_empty() {
                return Outcome::Completed;
            }

            let Some(snapshot) = self.executions.get(execution_id) else {
                return Outcome::Cancelled;
            };
            let scope = Arc::new(scope_for(&snapshot, self.config.expose_step_results));

            let mut join_set = JoinSet::new();
            for step_id in ready {
                let Some(step) = workflow.step(&step_id).cloned() else {
                    graph.mark_done(&step_id);
                    continue;
                };

                if let Some(blocker) = unmet_dependency(&step, &snapshot) {
                    info!(step_id = %step.id, blocker = %blocker, "skipping step");
                    let reason = format!("dependency '{blocker}' did not complete");
                    self.executions.update_active(execution_id, |e| {
                        e.steps
                            .insert(step.id.clone(), StepExecution::skipped(&step.id, reason));
                    });
                    graph.mark_done(&step.id);
                    continue;
                }

                let runner = Arc::clone(&self.runner);
                let executions = self.executions.clone();
                let execution_id = execution_id.to_owned();
                let scope = Arc::clone(&scope);
                let semaphore = semaphore.clone();
                let token = token.clone();

                join_set.spawn(async move {
                    let _permit = match semaphore {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    if token.is_cancelled() {
                        return (step.id, None);
                    }

                    let started = executions.update_active(&execution_id, |e| {
                        if let Some(record) = e.steps.get_mut(&step.id) {
                            record.state = StepState::Running;
                            record.started_at = Some(Utc::now());
                        }
                        e.current_step = Some(step.id.clone());
                    });
                    if !started {
                        return (step.id, None);
                    }

                    let record = runner.run_step(&step, &scope).await;
                    (step.id, Some(record))
                });
            }

            let mut culprits = Vec::new();
            let mut abort: Option<EngineError> = None;

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_id, Some(record))) => {
                        if let Some(step) = workflow.step(&step_id) {
                            if let Some(err) = escalation(step, &record) {
                                culprits.push(step_id.clone());
                                abort.get_or_insert(err);
                            }
                        }
                        self.executions.update_active(execution_id, |e| {
                            e.steps.insert(step_id.clone(), record);
                        });
                        graph.mark_done(&step_id);
                    }
                    Ok((step_id, None)) => graph.mark_done(&step_id),
                    Err(join_err) => {
                        error!("step task did not complete: {join_err}");
                        abort.get_or_insert(EngineError::StepTaskAborted(join_err.to_string()));
                    }
                }
            }

            if let Some(error) = abort {
                culprits.sort();
                return Outcome::Aborted { error, culprits };
            }
        }
    }

    /// Record the terminal state for `outcome`, running rollback if needed.
    async fn finalize(&self, workflow: &WorkflowDefinition, execution_id: &str, outcome: Outcome) {
        match outcome {
            Outcome::Completed => {
                self.executions
                    .update_active(execution_id, |e| {
                        e.transition(WorkflowState::Completed);
                    });
                info!(execution_id, "execution completed");
            }
            Outcome::Cancelled => {
                info!(execution_id, "execution stopped after cancellation");
            }
            Outcome::Failed(error) => self.fail(execution_id, &error),
            Outcome::Aborted { error, culprits } => {
                let compensates = match workflow.rollback_strategy {
                    RollbackStrategy::None => false,
                    RollbackStrategy::Failed => !culprits.is_empty(),
                    RollbackStrategy::All => true,
                };
                if !compensates {
                    self.fail(execution_id, &error);
                    return;
                }

                // Claim the rollback while the record is still RUNNING, so a
                // racing cancel is refused from here on.
                let claimed = self.executions.update_active(execution_id, |e| {
                    interrupt_running_steps(e, &error);
                    e.error = Some(error.to_string());
                    e.rolling_back = true;
                });
                if !claimed {
                    return;
                }
                let Some(mut execution) = self.executions.get(execution_id) else {
                    return;
                };

                warn!(
                    execution_id,
                    strategy = ?workflow.rollback_strategy,
                    "rolling back after: {error}"
                );
                let scope = scope_for(&execution, self.config.expose_step_results);
                self.rollback
                    .rollback(
                        workflow,
                        &mut execution,
                        workflow.rollback_strategy,
                        &culprits,
                        &scope,
                    )
                    .await;

                self.executions.update_active(execution_id, |e| {
                    e.steps = execution.steps;
                    e.rollback_errors = execution.rollback_errors;
                    e.transition(WorkflowState::RolledBack);
                });
                info!(execution_id, "execution rolled back");
            }
        }
    }

    fn fail(&self, execution_id: &str, error: &EngineError) {
        self.executions.update_active(execution_id, |e| {
            interrupt_running_steps(e, error);
            e.error = Some(error.to_string());
            e.transition(WorkflowState::Failed);
        });
        error!(execution_id, "execution failed: {error}");
    }

    fn snapshot(&self, execution_id: &str) -> Result<Execution, EngineError> {
        self.executions
            .get(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_owned()))
    }
}

/// First dependency of `step` that did not reach `COMPLETED`.
fn unmet_dependency<'a>(step: &'a StepDefinition, execution: &Execution) -> Option<&'a str> {
    step.dependencies
        .iter()
        .find(|dep| {
            execution
                .step(dep)
                .map_or(true, |record| record.state != StepState::Completed)
        })
        .map(String::as_str)
}

/// Ids of steps currently `RUNNING`, sorted.
fn running_steps(execution: &Execution) -> Vec<String> {
    let mut ids: Vec<String> = execution
        .steps
        .values()
        .filter(|s| s.state == StepState::Running)
        .map(|s| s.step_id.clone())
        .collect();
    ids.sort();
    ids
}

/// Steps left `RUNNING` by an aborted or cancelled run are marked `FAILED`.
fn interrupt_running_steps(execution: &mut Execution, cause: impl fmt::Display) {
    for record in execution.steps.values_mut() {
        if record.state == StepState::Running {
            record.state = StepState::Failed;
            record.completed_at = Some(Utc::now());
            record.error = Some(format!("interrupted: {cause}"));
        }
    }
}

/// The value placeholders are resolved against.
///
/// The caller's context, plus `steps.<id>.result` for completed steps when
/// enabled and the context is an object that doesn't define `steps` itself.
fn scope_for(execution: &Execution, expose_step_results: bool) -> Value {
    let mut scope = execution.context.clone();
    if !expose_step_results {
        return scope;
    }
    let Value::Object(fields) = &mut scope else {
        return scope;
    };
    if fields.contains_key("steps") {
        return scope;
    }

    let results: Map<String, Value> = execution
        .steps
        .values()
        .filter(|s| s.state == StepState::Completed)
        .filter_map(|s| {
            s.result
                .as_ref()
                .map(|r| (s.step_id.clone(), json!({ "result": r })))
        })
        .collect();
    fields.insert("steps".to_owned(), Value::Object(results));
    scope
}
