use std::sync::Arc;
use std::time::Duration;

use flotilla_core::adapters::LocalExecutionAdapter;
use flotilla_core::models::{
    CoreErrorKind, PlanDescriptor, PlanId, PlanStatus, TaskDescriptor, TaskId,
};
use flotilla_core::orchestration::{Orchestrator, OrchestratorConfig};
use flotilla_core::persistence::InMemoryStateStore;
use flotilla_core::registry::AdapterRegistry;
use serde_json::json;

fn echo(kind: &'static str) -> Arc<LocalExecutionAdapter> {
    Arc::new(LocalExecutionAdapter::new(kind, move |request, _token| async move {
        Ok(json!({ "backend": kind, "payload": request.payload }))
    }))
}

fn two_backends(config: OrchestratorConfig) -> Orchestrator {
    let registry = AdapterRegistry::new()
        .with_adapter(echo("batch"))
        .unwrap()
        .with_adapter(echo("interactive"))
        .unwrap();
    Orchestrator::new(registry, Arc::new(InMemoryStateStore::new()), config).unwrap()
}

fn fast() -> OrchestratorConfig {
    OrchestratorConfig::default().poll_interval(Duration::from_millis(5))
}

#[test]
fn yaml_descriptor_carries_retry_and_timeout_settings() {
    let descriptor = PlanDescriptor::from_yaml(
        r#"
id: nightly
name: Nightly build
backend: batch
max_concurrency: 2
metadata:
  owner: release-team
tasks:
  - id: compile
    payload: { target: "x86_64" }
    timeout_ms: 120000
    retry_policy:
      max_attempts: 4
      base_delay_ms: 250
      jitter_fraction: 0.0
  - id: package
    depends_on: [compile]
"#,
    )
    .unwrap();

    assert_eq!(descriptor.backend.as_deref(), Some("batch"));
    assert_eq!(descriptor.max_concurrency, Some(2));
    assert_eq!(descriptor.metadata["owner"], json!("release-team"));

    let compile = &descriptor.tasks[0];
    assert_eq!(compile.timeout_ms, Some(120_000));
    let retry = compile.retry_policy.as_ref().unwrap();
    assert_eq!(retry.max_attempts, 4);
    assert_eq!(retry.base_delay, Duration::from_millis(250));
    assert_eq!(retry.jitter_fraction, 0.0);
    assert_eq!(descriptor.tasks[1].depends_on, vec![TaskId::from("compile")]);
}

#[test]
fn json_and_yaml_describe_the_same_plan() {
    let from_json = PlanDescriptor::from_json(
        r#"{
            "id": "same",
            "name": "same",
            "tasks": [
                { "id": "a", "payload": 1 },
                { "id": "b", "depends_on": ["a"] }
            ]
        }"#,
    )
    .unwrap();
    let from_yaml = PlanDescriptor::from_yaml(
        "id: same\nname: same\ntasks:\n  - id: a\n    payload: 1\n  - id: b\n    depends_on: [a]\n",
    )
    .unwrap();
    assert_eq!(from_json, from_yaml);
}

#[test]
fn malformed_descriptors_are_validation_errors() {
    let missing_tasks = PlanDescriptor::from_yaml("id: x\nname: x\n").unwrap_err();
    assert_eq!(missing_tasks.kind, CoreErrorKind::Validation);

    let wrong_type = PlanDescriptor::from_json(r#"{"id": "x", "name": "x", "tasks": 3}"#)
        .unwrap_err();
    assert_eq!(wrong_type.kind, CoreErrorKind::Validation);
}

#[tokio::test]
async fn field_level_constraints_are_checked_on_submit() {
    let orchestrator = two_backends(fast().default_backend("batch"));

    let zero_timeout = PlanDescriptor::new("zero-timeout", "z")
        .task(TaskDescriptor::new("a").timeout_ms(0));
    let error = orchestrator.submit_plan(zero_timeout).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);
    assert_eq!(error.task, Some(TaskId::from("a")));

    let no_attempts = PlanDescriptor::new("no-attempts", "n").task(
        TaskDescriptor::new("a")
            .retry_policy(flotilla_core::models::RetryPolicy::default().max_attempts(0)),
    );
    let error = orchestrator.submit_plan(no_attempts).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);

    let zero_concurrency = PlanDescriptor::new("zero-concurrency", "z")
        .max_concurrency(0)
        .task(TaskDescriptor::new("a"));
    let error = orchestrator.submit_plan(zero_concurrency).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);

    for id in ["zero-timeout", "no-attempts", "zero-concurrency"] {
        let missing = orchestrator.get_plan(&PlanId::from(id)).await.unwrap_err();
        assert_eq!(missing.kind, CoreErrorKind::NotFound);
    }
}

#[tokio::test]
async fn backend_must_be_named_when_several_are_registered() {
    let orchestrator = two_backends(fast());
    let plan = PlanDescriptor::new("ambiguous", "ambiguous").task(TaskDescriptor::new("a"));
    let error = orchestrator.submit_plan(plan).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);
    assert_eq!(error.plan, Some(PlanId::from("ambiguous")));

    let unknown = PlanDescriptor::new("unknown", "unknown")
        .backend("gpu")
        .task(TaskDescriptor::new("a"));
    let error = orchestrator.submit_plan(unknown).await.unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::Validation);
}

#[tokio::test]
async fn plans_run_on_the_named_or_default_backend() {
    let orchestrator = two_backends(fast().default_backend("batch"));

    let defaulted = PlanDescriptor::new("defaulted", "defaulted")
        .task(TaskDescriptor::new("a").payload(json!("x")));
    let named = PlanDescriptor::new("named", "named")
        .backend("interactive")
        .task(TaskDescriptor::new("a").payload(json!("y")));

    let defaulted = orchestrator.submit_plan(defaulted).await.unwrap();
    let named = orchestrator.submit_plan(named).await.unwrap();

    for (plan_id, backend, payload) in [(defaulted, "batch", "x"), (named, "interactive", "y")] {
        let state = orchestrator
            .wait_for_terminal(&plan_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(state.status(), PlanStatus::Completed);
        assert_eq!(state.plan.backend, backend);
        let report = orchestrator.plan_report(&plan_id).await.unwrap();
        assert_eq!(
            report.outputs[&TaskId::from("a")],
            json!({ "backend": backend, "payload": payload })
        );
    }
}
