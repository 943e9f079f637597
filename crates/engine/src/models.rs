//! Core domain models for the workflow engine.
//!
//! Definitions (`WorkflowDefinition`, `StepDefinition`) are immutable
//! templates; `Execution` and `StepExecution` are the mutable records of one
//! run.  All of them serialise to camelCase JSON for the outer tool layer.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Which completed work gets compensated when a run aborts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Abort without compensating anything.
    #[default]
    None,
    /// Compensate only the step(s) that caused the abort.
    Failed,
    /// Compensate every completed step, newest first.
    All,
}

/// Retry settings for a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one. Must be at least 1.
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

/// Compensating action that undoes a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub tool: String,
    #[serde(default = "empty_object")]
    pub args: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Unique within the workflow; referenced by other steps' `dependencies`.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Operation name handed to the tool executor.
    pub tool: String,
    /// Argument template; string values may contain `${path.to.value}`.
    #[serde(default = "empty_object")]
    pub args: Value,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackAction>,
}

impl StepDefinition {
    /// Step calling `tool` with `args`, named after its id.
    pub fn new(id: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            tool: tool.into(),
            args,
            dependencies: BTreeSet::new(),
            continue_on_error: false,
            retry_policy: None,
            rollback: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    pub fn with_rollback(mut self, tool: impl Into<String>, args: Value) -> Self {
        self.rollback = Some(RollbackAction {
            tool: tool.into(),
            args,
        });
        self
    }

    /// The effective policy: one attempt, no delay, unless configured.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.unwrap_or_default()
    }
}

/// A complete, versioned workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepDefinition>,
    /// Advisory run-time limit in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<u64>,
    #[serde(default)]
    pub rollback_strategy: RollbackStrategy,
}

fn default_version() -> String {
    "1.0.0".to_owned()
}

impl WorkflowDefinition {
    /// Convenience constructor for testing.
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            version: default_version(),
            steps,
            max_duration: None,
            rollback_strategy: RollbackStrategy::None,
        }
    }

    pub fn with_rollback_strategy(mut self, strategy: RollbackStrategy) -> Self {
        self.rollback_strategy = strategy;
        self
    }

    pub fn with_max_duration(mut self, millis: u64) -> Self {
        self.max_duration = Some(millis);
        self
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Cancelled
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkflowState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"     => Ok(Self::Pending),
            "running"     => Ok(Self::Running),
            "completed"   => Ok(Self::Completed),
            "failed"      => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            "cancelled"   => Ok(Self::Cancelled),
            other         => Err(format!("unknown workflow state: {other}")),
        }
    }
}

/// Lifecycle of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Its compensating action ran successfully.
    RolledBack,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

/// Per-step record within an [`Execution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub state: StepState,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StepExecution {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            state: StepState::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            state: StepState::Skipped,
            completed_at: Some(Utc::now()),
            error: Some(reason.into()),
            ..Self::pending(step_id)
        }
    }
}

/// One run of a workflow against a runtime context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub state: WorkflowState,
    pub context: Value,
    pub steps: HashMap<String, StepExecution>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    /// Compensating calls that themselves failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollback_errors: Vec<String>,
    /// Set while compensating actions run; the execution can't be cancelled.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rolling_back: bool,
}

impl Execution {
    /// New execution in `PENDING` with every step `PENDING`.
    pub fn new(workflow: &WorkflowDefinition, context: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            state: WorkflowState::Pending,
            context,
            steps: workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepExecution::pending(&s.id)))
                .collect(),
            started_at: Utc::now(),
            completed_at: None,
            current_step: None,
            error: None,
            rollback_errors: Vec::new(),
            rolling_back: false,
        }
    }

    /// Move to `next`, refusing to leave a terminal state.
    ///
    /// Returns whether the transition happened.
    pub fn transition(&mut self, next: WorkflowState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.current_step = None;
            self.rolling_back = false;
        }
        true
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.get(step_id)
    }
}

/// Criteria for `list_executions`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    pub state: Option<WorkflowState>,
    pub workflow_id: Option<String>,
}

impl ExecutionFilter {
    pub fn state(state: WorkflowState) -> Self {
        Self {
            state: Some(state),
            workflow_id: None,
        }
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.state.map_or(true, |s| execution.state == s)
            && self
                .workflow_id
                .as_deref()
                .map_or(true, |id| execution.workflow_id == id)
    }
}
