//! Dependency graph — definition validation and ready-set scheduling.
//!
//! Rules enforced at registration ([`validate_definition`]):
//! 1. The workflow id is non-empty.
//! 2. Step IDs are unique within the workflow.
//! 3. Every dependency names a declared step.
//! 4. Retry policies allow at least one attempt.
//!
//! Cycles are *not* a registration error: they surface when the engine asks
//! [`DependencyGraph`] for a ready set and nothing can ever become ready.

use std::collections::{HashMap, HashSet};

use crate::models::{StepDefinition, WorkflowDefinition};
use crate::EngineError;

/// Validate a workflow definition before it is registered.
///
/// # Errors
/// - [`EngineError::EmptyWorkflowId`] if the id is blank.
/// - [`EngineError::DuplicateStepId`] if two steps share an ID.
/// - [`EngineError::UnknownDependency`] if a dependency references a missing step.
/// - [`EngineError::InvalidRetryPolicy`] if a retry policy has `maxAttempts == 0`.
pub fn validate_definition(workflow: &WorkflowDefinition) -> Result<(), EngineError> {
    if workflow.id.trim().is_empty() {
        return Err(EngineError::EmptyWorkflowId);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        if let Some(dependency) = step
            .dependencies
            .iter()
            .find(|dep| !seen_ids.contains(dep.as_str()))
        {
            return Err(EngineError::UnknownDependency {
                step_id: step.id.clone(),
                dependency: dependency.clone(),
            });
        }
        if step.retry_policy.is_some_and(|p| p.max_attempts == 0) {
            return Err(EngineError::InvalidRetryPolicy(step.id.clone()));
        }
    }

    Ok(())
}

/// Kahn-style scheduler over step dependencies.
///
/// Each call to [`DependencyGraph::next_ready_set`] hands out every step whose
/// in-degree has dropped to zero and that hasn't been handed out yet.  The
/// caller reports finished steps with [`DependencyGraph::mark_done`], which
/// decrements the in-degree of their dependents.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step IDs in declaration order, so ready sets are deterministic.
    order: Vec<String>,
    in_degree: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    scheduled: HashSet<String>,
    done: HashSet<String>,
}

impl DependencyGraph {
    pub fn new(steps: &[StepDefinition]) -> Self {
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for step in steps {
            in_degree.insert(step.id.clone(), step.dependencies.len());
            for dep in &step.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        Self {
            order: steps.iter().map(|s| s.id.clone()).collect(),
            in_degree,
            dependents,
            scheduled: HashSet::new(),
            done: HashSet::new(),
        }
    }

    /// Next batch of steps whose dependencies have all finished.
    ///
    /// Returns an empty set when everything has been scheduled, or when the
    /// only remaining work is waiting on steps still in flight.
    ///
    /// # Errors
    /// [`EngineError::DeadlockDetected`] if nothing is in flight, nothing is
    /// ready, and unscheduled steps remain.
    pub fn next_ready_set(&mut self) -> Result<Vec<String>, EngineError> {
        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.scheduled.contains(*id) && self.in_degree[*id] == 0)
            .cloned()
            .collect();

        if ready.is_empty() && self.in_flight() == 0 && !self.is_finished() {
            let unresolved = self
                .order
                .iter()
                .filter(|id| !self.scheduled.contains(*id))
                .cloned()
                .collect();
            return Err(EngineError::DeadlockDetected { unresolved });
        }

        self.scheduled.extend(ready.iter().cloned());
        Ok(ready)
    }

    /// Record that `step_id` reached a terminal state.
    pub fn mark_done(&mut self, step_id: &str) {
        if !self.done.insert(step_id.to_owned()) {
            return;
        }
        if let Some(dependents) = self.dependents.get(step_id) {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
    }

    /// Every step has been handed out.
    pub fn is_finished(&self) -> bool {
        self.scheduled.len() == self.order.len()
    }

    fn in_flight(&self) -> usize {
        self.scheduled.len() - self.scheduled.intersection(&self.done).count()
    }
}

/// The full sequence of ready sets for `steps`, assuming every step finishes.
///
/// # Errors
/// [`EngineError::DeadlockDetected`] if the graph contains a cycle.
pub fn compute_ready_sets(steps: &[StepDefinition]) -> Result<Vec<Vec<String>>, EngineError> {
    let mut graph = DependencyGraph::new(steps);
    let mut sets = Vec::new();

    while !graph.is_finished() {
        let ready = graph.next_ready_set()?;
        for id in &ready {
            graph.mark_done(id);
        }
        sets.push(ready);
    }

    Ok(sets)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn step(id: &str, deps: &[&str]) -> StepDefinition {
        StepDefinition::new(id, "noop", Value::Null).depends_on(deps.iter().copied())
    }

    #[test]
    fn linear_chain_yields_one_step_per_set() {
        // A → B → C
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let sets = compute_ready_sets(&steps).expect("should be valid");
        assert_eq!(sets, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn diamond_runs_middle_steps_together() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let sets = compute_ready_sets(&steps).expect("should be valid");
        assert_eq!(sets, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn dependencies_may_be_declared_later() {
        let steps = vec![step("activate", &["property"]), step("property", &[])];
        let sets = compute_ready_sets(&steps).expect("should be valid");
        assert_eq!(sets, vec![vec!["property"], vec!["activate"]]);
    }

    #[test]
    fn two_step_cycle_is_a_deadlock() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = compute_ready_sets(&steps).unwrap_err();
        assert!(err.to_string().contains("deadlock"));
        assert_eq!(
            err,
            EngineError::DeadlockDetected {
                unresolved: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn cycle_behind_a_valid_prefix_is_detected() {
        // root → x ⇄ y
        let steps = vec![step("root", &[]), step("x", &["root", "y"]), step("y", &["x"])];
        let mut graph = DependencyGraph::new(&steps);

        assert_eq!(graph.next_ready_set().unwrap(), vec!["root"]);
        graph.mark_done("root");
        assert!(matches!(
            graph.next_ready_set(),
            Err(EngineError::DeadlockDetected { unresolved }) if unresolved == ["x", "y"]
        ));
    }

    #[test]
    fn in_flight_steps_are_not_a_deadlock() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let mut graph = DependencyGraph::new(&steps);

        assert_eq!(graph.next_ready_set().unwrap(), vec!["a"]);
        assert!(graph.next_ready_set().unwrap().is_empty());
        graph.mark_done("a");
        assert_eq!(graph.next_ready_set().unwrap(), vec!["b"]);
        assert!(graph.is_finished());
    }

    #[test]
    fn empty_workflow_has_no_ready_sets() {
        assert!(compute_ready_sets(&[]).unwrap().is_empty());
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let wf = WorkflowDefinition::new("wf", vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(
            validate_definition(&wf),
            Err(EngineError::DuplicateStepId(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_step_is_rejected() {
        let wf = WorkflowDefinition::new("wf", vec![step("a", &["ghost"])]);
        assert!(matches!(
            validate_definition(&wf),
            Err(EngineError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn zero_attempt_retry_policy_is_rejected() {
        let wf = WorkflowDefinition::new("wf", vec![step("a", &[]).with_retry(0, 10)]);
        assert_eq!(
            validate_definition(&wf),
            Err(EngineError::InvalidRetryPolicy("a".into()))
        );
    }

    #[test]
    fn cyclic_definition_still_registers() {
        let wf = WorkflowDefinition::new("wf", vec![step("a", &["b"]), step("b", &["a"])]);
        assert!(validate_definition(&wf).is_ok());
    }
}
