//! End-to-end tests for the workflow engine.
//!
//! Every test drives `WorkflowEngine` against `MockToolExecutor`, so no CDN
//! provider is involved; assertions look at the final `Execution` record and
//! at the calls the mock received.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tools::mock::MockToolExecutor;

use crate::{
    EngineConfig, EngineError, Execution, ExecutionFilter, RollbackStrategy, StepDefinition,
    StepState, WorkflowDefinition, WorkflowEngine, WorkflowState,
};

fn engine(mock: &MockToolExecutor) -> WorkflowEngine {
    engine_with(mock, EngineConfig::default())
}

fn engine_with(mock: &MockToolExecutor, config: EngineConfig) -> WorkflowEngine {
    WorkflowEngine::new(Arc::new(mock.clone()), config)
}

fn step(id: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition::new(id, id, json!({})).depends_on(deps.iter().copied())
}

/// The site-migration chain: zone → cert → property → activate.
fn migrate_site(strategy: RollbackStrategy) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "migrate-site",
        vec![
            StepDefinition::new("zone", "create_zone", json!({ "zone": "${domain}" }))
                .with_rollback("delete_zone", json!({ "zone": "${domain}" })),
            StepDefinition::new("cert", "create_enrollment", json!({ "cn": "${domain}" }))
                .depends_on(["zone"])
                .with_rollback("delete_enrollment", json!({ "id": "${steps.cert.result.id}" })),
            StepDefinition::new("property", "create_property", json!({ "host": "${domain}" }))
                .depends_on(["cert"]),
            StepDefinition::new("activate", "activate_property", json!({}))
                .depends_on(["property"]),
        ],
    )
    .with_rollback_strategy(strategy)
}

async fn run(engine: &WorkflowEngine, workflow: WorkflowDefinition) -> Execution {
    let id = workflow.id.clone();
    engine.register_workflow(workflow).expect("valid workflow");
    engine
        .execute_workflow(&id, Some(json!({ "domain": "example.com" })))
        .await
        .expect("registered workflow")
}

// ============================================================
// Happy path and ordering
// ============================================================

#[tokio::test]
async fn dag_with_successful_tools_completes() {
    let mock = MockToolExecutor::new();
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "diamond",
        vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), step("d", &["b", "c"])],
    );

    let exec = run(&engine, wf).await;

    assert_eq!(exec.state, WorkflowState::Completed);
    assert!(exec.completed_at.is_some());
    assert!(exec.error.is_none());
    assert_eq!(exec.steps.len(), 4);
    for record in exec.steps.values() {
        assert_eq!(record.state, StepState::Completed, "step {}", record.step_id);
        assert_eq!(record.attempts, 1);
    }
    assert_eq!(mock.total_calls(), 4);
}

#[tokio::test]
async fn steps_start_after_their_dependencies_complete() {
    let mock = MockToolExecutor::new()
        .delayed("b", Duration::from_millis(20))
        .delayed("c", Duration::from_millis(5));
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "diamond",
        vec![step("a", &[]), step("b", &["a"]), step("c", &["a"]), step("d", &["b", "c"])],
    );

    let exec = run(&engine, wf.clone()).await;

    for def in &wf.steps {
        let started = exec.steps[&def.id].started_at.expect("step ran");
        for dep in &def.dependencies {
            let dep_done = exec.steps[dep].completed_at.expect("dependency finished");
            assert!(started >= dep_done, "{} started before {} completed", def.id, dep);
        }
    }
}

#[tokio::test]
async fn arguments_are_interpolated_from_context_and_earlier_results() {
    let mock = MockToolExecutor::new()
        .returning("create_zone", json!({ "zoneId": "z-42" }))
        .returning("create_records", json!({}));
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "dns",
        vec![
            StepDefinition::new("zone", "create_zone", json!({ "zone": "${domain}" })),
            StepDefinition::new(
                "records",
                "create_records",
                json!({ "zoneId": "${steps.zone.result.zoneId}", "name": "www.${domain}" }),
            )
            .depends_on(["zone"]),
        ],
    );

    let exec = run(&engine, wf).await;

    assert_eq!(exec.state, WorkflowState::Completed);
    assert_eq!(mock.calls_to("create_zone")[0].args, json!({ "zone": "example.com" }));
    assert_eq!(
        mock.calls_to("create_records")[0].args,
        json!({ "zoneId": "z-42", "name": "www.example.com" })
    );
}

// ============================================================
// Deadlock
// ============================================================

#[tokio::test]
async fn cyclic_workflow_fails_without_calling_tools() {
    let mock = MockToolExecutor::new();
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "cyclic",
        vec![step("root", &[]), step("a", &["b"]), step("b", &["a"])],
    );

    let exec = run(&engine, wf).await;

    assert_eq!(exec.state, WorkflowState::Failed);
    assert!(exec.error.as_deref().unwrap().contains("deadlock"));
    assert_eq!(mock.total_calls(), 0);
    assert!(exec.steps.values().all(|s| s.state == StepState::Pending));
}

// ============================================================
// Retry and partial failure
// ============================================================

#[tokio::test]
async fn retry_policy_recovers_flaky_step() {
    let mock = MockToolExecutor::new().flaky("issue_cert", 2, json!({ "certId": "c-1" }));
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "cert",
        vec![StepDefinition::new("cert", "issue_cert", json!({})).with_retry(3, 10)],
    );

    let exec = run(&engine, wf).await;

    let cert = exec.step("cert").unwrap();
    assert_eq!(cert.attempts, 3);
    assert_eq!(cert.state, StepState::Completed);
    assert_eq!(cert.result, Some(json!({ "certId": "c-1" })));
    assert_eq!(exec.state, WorkflowState::Completed);
}

#[tokio::test]
async fn continue_on_error_lets_siblings_finish() {
    let mock = MockToolExecutor::new().failing("purge", "rate limited");
    let engine = engine(&mock);
    let wf = WorkflowDefinition::new(
        "purge-and-report",
        vec![
            StepDefinition::new("purge", "purge", json!({})).continue_on_error(),
            step("report", &[]),
            step("verify", &["purge"]),
            step("notify", &["verify"]),
        ],
    );

    let exec = run(&engine, wf).await;

    assert_eq!(exec.state, WorkflowState::Completed);
    assert_eq!(exec.steps["purge"].state, StepState::Failed);
    assert_eq!(exec.steps["report"].state, StepState::Completed);
    assert_eq!(exec.steps["verify"].state, StepState::Skipped);
    assert_eq!(exec.steps["notify"].state, StepState::Skipped);
    assert_eq!(mock.call_count("verify"), 0);
    assert_eq!(mock.call_count("notify"), 0);
}

// ============================================================
// Rollback
// ============================================================

#[tokio::test]
async fn rollback_all_compensates_completed_steps_in_reverse() {
    let mock = MockToolExecutor::new()
        .returning("create_enrollment", json!({ "id": "enr-7" }))
        .failing("create_property", "contract not found");
    let engine = engine(&mock);

    let exec = run(&engine, migrate_site(RollbackStrategy::All)).await;

    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert!(exec.error.as_deref().unwrap().contains("property"));
    let compensations: Vec<String> = mock
        .calls()
        .into_iter()
        .map(|c| c.tool)
        .filter(|t| t.starts_with("delete_"))
        .collect();
    assert_eq!(compensations, vec!["delete_enrollment", "delete_zone"]);
    assert_eq!(mock.calls_to("delete_enrollment")[0].args, json!({ "id": "enr-7" }));
    assert_eq!(mock.calls_to("delete_zone")[0].args, json!({ "zone": "example.com" }));
    assert_eq!(exec.steps["zone"].state, StepState::RolledBack);
    assert_eq!(exec.steps["cert"].state, StepState::RolledBack);
    assert_eq!(exec.steps["property"].state, StepState::Failed);
    assert_eq!(exec.steps["activate"].state, StepState::Pending);
    assert_eq!(mock.call_count("activate_property"), 0);
}

#[tokio::test]
async fn rollback_none_leaves_execution_failed() {
    let mock = MockToolExecutor::new().failing("create_property", "contract not found");
    let engine = engine(&mock);

    let exec = run(&engine, migrate_site(RollbackStrategy::None)).await;

    assert_eq!(exec.state, WorkflowState::Failed);
    assert!(exec.error.as_deref().unwrap().contains("contract not found"));
    assert_eq!(mock.call_count("delete_zone"), 0);
    assert_eq!(mock.call_count("delete_enrollment"), 0);
}

#[tokio::test]
async fn rollback_failed_compensates_only_the_failing_step() {
    let mock = MockToolExecutor::new().failing("create_enrollment", "dv validation failed");
    let engine = engine(&mock);

    let exec = run(&engine, migrate_site(RollbackStrategy::Failed)).await;

    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert_eq!(mock.call_count("delete_enrollment"), 1);
    assert_eq!(mock.call_count("delete_zone"), 0);
    assert_eq!(exec.steps["cert"].state, StepState::RolledBack);
    assert_eq!(exec.steps["zone"].state, StepState::Completed);
}

#[tokio::test]
async fn failing_compensation_still_ends_rolled_back() {
    let mock = MockToolExecutor::new()
        .failing("create_property", "contract not found")
        .failing("delete_enrollment", "enrollment locked");
    let engine = engine(&mock);

    let exec = run(&engine, migrate_site(RollbackStrategy::All)).await;

    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert_eq!(exec.rollback_errors.len(), 1);
    assert!(exec.rollback_errors[0].contains("enrollment locked"));
    assert_eq!(exec.steps["zone"].state, StepState::RolledBack);
    assert_eq!(exec.steps["cert"].state, StepState::Completed);
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn cancelling_a_running_execution_stops_scheduling() {
    let mock = MockToolExecutor::new().delayed("slow", Duration::from_millis(200));
    let engine = Arc::new(engine(&mock));
    engine
        .register_workflow(WorkflowDefinition::new(
            "slow",
            vec![step("slow", &[]), step("after", &["slow"])],
        ))
        .unwrap();

    let handle = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute_workflow("slow", None).await })
    };

    let running = ExecutionFilter::state(WorkflowState::Running);
    let mut execution_id = None;
    for _ in 0..100 {
        let found = engine.list_executions(&running).into_iter().next();
        if let Some(exec) = found.filter(|e| e.steps["slow"].state == StepState::Running) {
            execution_id = Some(exec.id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let execution_id = execution_id.expect("slow step should be running");

    engine.cancel_workflow(&execution_id).expect("running execution is cancellable");
    let cancelled = engine.get_execution(&execution_id).unwrap();
    assert_eq!(cancelled.state, WorkflowState::Cancelled);
    // The in-flight step is closed out with the execution.
    let slow = &cancelled.steps["slow"];
    assert_eq!(slow.state, StepState::Failed);
    assert!(slow.completed_at.is_some());
    assert!(slow.error.as_deref().unwrap().contains("execution cancelled"));

    let exec = handle.await.unwrap().unwrap();
    assert_eq!(exec.state, WorkflowState::Cancelled);
    assert_eq!(exec.steps["slow"].state, StepState::Failed);
    assert_eq!(mock.call_count("after"), 0);

    let again = engine.cancel_workflow(&execution_id).unwrap_err();
    assert_eq!(again.to_string(), "Cannot cancel workflow in state: cancelled");
}

#[tokio::test]
async fn cancelling_during_rollback_is_refused() {
    let mock = MockToolExecutor::new()
        .failing("create_enrollment", "CA unavailable")
        .delayed("delete_zone", Duration::from_millis(200));
    let engine = Arc::new(engine(&mock));
    engine
        .register_workflow(migrate_site(RollbackStrategy::All))
        .unwrap();

    let handle = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_workflow("migrate-site", Some(json!({ "domain": "example.com" })))
                .await
        })
    };

    for _ in 0..100 {
        if mock.call_count("delete_zone") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(mock.call_count("delete_zone"), 1, "rollback should be under way");
    let execution_id = engine.list_executions(&ExecutionFilter::default())[0].id.clone();

    let err = engine.cancel_workflow(&execution_id).unwrap_err();
    assert_eq!(err, EngineError::RollbackInProgress(execution_id.clone()));
    let during = engine.get_execution(&execution_id).unwrap();
    assert_eq!(during.state, WorkflowState::Running);
    assert!(during.error.as_deref().unwrap().contains("CA unavailable"));

    let exec = handle.await.unwrap().unwrap();
    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert!(!exec.rolling_back);
    assert!(exec.error.as_deref().unwrap().contains("CA unavailable"));
    assert_eq!(exec.steps["zone"].state, StepState::RolledBack);
}

#[tokio::test]
async fn cancelling_a_completed_execution_fails() {
    let mock = MockToolExecutor::new();
    let engine = engine(&mock);
    let exec = run(&engine, WorkflowDefinition::new("one", vec![step("a", &[])])).await;

    let err = engine.cancel_workflow(&exec.id).unwrap_err();

    assert_eq!(err, EngineError::CannotCancel(WorkflowState::Completed));
    assert_eq!(err.to_string(), "Cannot cancel workflow in state: completed");
}

// ============================================================
// Lookup errors and registries
// ============================================================

#[tokio::test]
async fn unknown_ids_are_reported() {
    let engine = engine(&MockToolExecutor::new());

    let err = engine.execute_workflow("nope", None).await.unwrap_err();
    assert!(err.to_string().contains("Workflow not found"));

    let err = engine.cancel_workflow("nope").unwrap_err();
    assert!(err.to_string().contains("Execution not found"));

    assert!(engine.get_execution("nope").is_none());
}

#[tokio::test]
async fn registry_accessors_list_and_filter() {
    let mock = MockToolExecutor::new().failing("boom", "kaput");
    let engine = engine(&mock);
    engine
        .register_workflow(WorkflowDefinition::new("ok", vec![step("a", &[])]))
        .unwrap();
    engine
        .register_workflow(WorkflowDefinition::new(
            "bad",
            vec![StepDefinition::new("b", "boom", json!({}))],
        ))
        .unwrap();

    engine.execute_workflow("ok", None).await.unwrap();
    engine.execute_workflow("ok", None).await.unwrap();
    engine.execute_workflow("bad", None).await.unwrap();

    let ids: Vec<String> = engine.list_workflows().iter().map(|w| w.id.clone()).collect();
    assert_eq!(ids, vec!["bad", "ok"]);
    assert_eq!(engine.list_executions(&ExecutionFilter::default()).len(), 3);
    assert_eq!(
        engine
            .list_executions(&ExecutionFilter::state(WorkflowState::Completed))
            .len(),
        2
    );
    let failed = engine.list_executions(&ExecutionFilter::state(WorkflowState::Failed));
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].workflow_id, "bad");

    engine.clear_executions();
    assert!(engine.list_executions(&ExecutionFilter::default()).is_empty());
}

#[tokio::test]
async fn reregistering_replaces_the_definition() {
    let mock = MockToolExecutor::new();
    let engine = engine(&mock);
    engine
        .register_workflow(WorkflowDefinition::new("purge", vec![step("v1", &[])]))
        .unwrap();
    engine
        .register_workflow(WorkflowDefinition::new("purge", vec![step("v2", &[])]))
        .unwrap();

    let exec = engine.execute_workflow("purge", None).await.unwrap();

    assert!(exec.steps.contains_key("v2"));
    assert_eq!(mock.call_count("v1"), 0);
    assert_eq!(engine.list_workflows().len(), 1);
}

#[test]
fn invalid_definitions_are_rejected_at_registration() {
    let engine = engine(&MockToolExecutor::new());
    let err = engine
        .register_workflow(WorkflowDefinition::new("wf", vec![step("a", &["ghost"])]))
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownDependency { .. }));
    assert!(engine.list_workflows().is_empty());
}

// ============================================================
// Concurrency
// ============================================================

fn fan_out() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "fan-out",
        vec![step("purge_a", &[]), step("purge_b", &[]), step("purge_c", &[])],
    )
}

fn slow_purges() -> MockToolExecutor {
    MockToolExecutor::new()
        .delayed("purge_a", Duration::from_millis(40))
        .delayed("purge_b", Duration::from_millis(40))
        .delayed("purge_c", Duration::from_millis(40))
}

#[tokio::test]
async fn ready_set_runs_in_parallel_by_default() {
    let mock = slow_purges();
    let engine = engine(&mock);

    let exec = run(&engine, fan_out()).await;

    let latest_start = exec.steps.values().filter_map(|s| s.started_at).max().unwrap();
    let earliest_end = exec.steps.values().filter_map(|s| s.completed_at).min().unwrap();
    assert!(latest_start < earliest_end, "all three should overlap");
}

#[tokio::test]
async fn max_concurrency_serializes_a_ready_set() {
    let mock = slow_purges();
    let engine = engine_with(
        &mock,
        EngineConfig {
            max_concurrency: Some(1),
            ..EngineConfig::default()
        },
    );

    let exec = run(&engine, fan_out()).await;

    assert_eq!(exec.state, WorkflowState::Completed);
    let mut windows: Vec<_> = exec
        .steps
        .values()
        .map(|s| (s.started_at.unwrap(), s.completed_at.unwrap()))
        .collect();
    windows.sort();
    for pair in windows.windows(2) {
        assert!(pair[1].0 >= pair[0].1, "steps overlapped despite a limit of 1");
    }
}

#[tokio::test]
async fn independent_executions_run_concurrently() {
    let mock = MockToolExecutor::new().delayed("slow", Duration::from_millis(30));
    let engine = Arc::new(engine(&mock));
    engine
        .register_workflow(WorkflowDefinition::new("slow", vec![step("slow", &[])]))
        .unwrap();

    let runs: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .execute_workflow("slow", Some(json!({ "run": i })))
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in runs {
        let exec = handle.await.unwrap().unwrap();
        assert_eq!(exec.state, WorkflowState::Completed);
        ids.push(exec.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(mock.call_count("slow"), 4);
}

// ============================================================
// maxDuration
// ============================================================

fn long_running() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "long",
        vec![
            StepDefinition::new("zone", "create_zone", json!({}))
                .with_rollback("delete_zone", json!({})),
            step("slow", &["zone"]),
        ],
    )
    .with_max_duration(20)
}

#[tokio::test]
async fn max_duration_is_advisory_by_default() {
    let mock = MockToolExecutor::new().delayed("slow", Duration::from_millis(60));
    let engine = engine(&mock);

    let exec = run(&engine, long_running()).await;

    assert_eq!(exec.state, WorkflowState::Completed);
}

#[tokio::test]
async fn enforced_max_duration_aborts_the_run() {
    let mock = MockToolExecutor::new().delayed("slow", Duration::from_millis(500));
    let engine = engine_with(
        &mock,
        EngineConfig {
            enforce_max_duration: true,
            ..EngineConfig::default()
        },
    );

    let exec = run(&engine, long_running().with_rollback_strategy(RollbackStrategy::All)).await;

    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert!(exec.error.as_deref().unwrap().contains("maxDuration of 20ms"));
    assert_eq!(exec.steps["slow"].state, StepState::Failed);
    assert_eq!(mock.call_count("delete_zone"), 1);
}

#[tokio::test]
async fn max_duration_with_failed_strategy_compensates_the_interrupted_step() {
    let mock = MockToolExecutor::new().delayed("slow", Duration::from_millis(500));
    let engine = engine_with(
        &mock,
        EngineConfig {
            enforce_max_duration: true,
            ..EngineConfig::default()
        },
    );
    let wf = WorkflowDefinition::new(
        "long",
        vec![
            StepDefinition::new("zone", "create_zone", json!({}))
                .with_rollback("delete_zone", json!({})),
            step("slow", &["zone"]).with_rollback("undo_slow", json!({})),
        ],
    )
    .with_max_duration(20)
    .with_rollback_strategy(RollbackStrategy::Failed);

    let exec = run(&engine, wf).await;

    assert_eq!(exec.state, WorkflowState::RolledBack);
    assert!(exec.error.as_deref().unwrap().contains("maxDuration of 20ms"));
    assert_eq!(mock.call_count("undo_slow"), 1);
    assert_eq!(exec.steps["slow"].state, StepState::RolledBack);
    assert_eq!(mock.call_count("delete_zone"), 0);
    assert_eq!(exec.steps["zone"].state, StepState::Completed);
}
