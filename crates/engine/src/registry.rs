//! In-memory workflow and execution stores.
//!
//! Both are cheap to clone (shared `Arc<DashMap>` inside) so the engine can
//! hand them to spawned step tasks.  Concurrent reads and inserts from
//! independent executions never block each other beyond a shard lock.

use std::sync::Arc;

use dashmap::DashMap;

use crate::models::{Execution, ExecutionFilter, WorkflowDefinition};

/// Registered workflow definitions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: Arc<DashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the definition with the same id.
    pub fn insert(&self, workflow: WorkflowDefinition) {
        self.workflows
            .insert(workflow.id.clone(), Arc::new(workflow));
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// All definitions, ordered by id.
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self
            .workflows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// Execution records keyed by execution id.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    executions: Arc<DashMap<String, Execution>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, execution: Execution) {
        self.executions.insert(execution.id.clone(), execution);
    }

    /// Snapshot of one execution.
    pub fn get(&self, id: &str) -> Option<Execution> {
        self.executions.get(id).map(|entry| entry.value().clone())
    }

    /// Apply `f` to the stored record while holding its shard lock.
    ///
    /// Returns `None` if the id is unknown.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Execution) -> R) -> Option<R> {
        self.executions.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Like [`ExecutionRegistry::update`], but leaves terminal records untouched.
    pub fn update_active(&self, id: &str, f: impl FnOnce(&mut Execution)) -> bool {
        self.update(id, |execution| {
            if execution.state.is_terminal() {
                false
            } else {
                f(execution);
                true
            }
        })
        .unwrap_or(false)
    }

    /// Executions matching `filter`, oldest first.
    pub fn list(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        let mut matching: Vec<Execution> = self
            .executions
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matching.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        matching
    }

    pub fn clear(&self) {
        self.executions.clear();
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}
