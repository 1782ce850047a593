use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use flotilla_core::adapters::{DispatchRequest, ExecutionAdapter, LocalExecutionAdapter};
use flotilla_core::models::{
    AdapterHandle, IdempotencyKey, PlanDescriptor, PlanId, PlanState, PlanStatus, RetryPolicy,
    TaskDescriptor, TaskHandle, TaskId, TaskResult, TaskStatus,
};
use flotilla_core::orchestration::{
    ManualResolution, Orchestrator, OrchestratorConfig, ResumeFallback, ResumePolicy,
};
use flotilla_core::persistence::{InMemoryStateStore, StateStore};
use flotilla_core::registry::AdapterRegistry;
use serde_json::json;

fn adapter() -> LocalExecutionAdapter {
    LocalExecutionAdapter::new("local", |request, _token| async move {
        Ok(json!({ "ran": request.key.task_id.0, "attempt": request.key.attempt }))
    })
}

/// A plan persisted by a worker that died while `b` was dispatched: `a`
/// already succeeded, `c` waits on `b`.
fn crashed_state(b_handle: Option<AdapterHandle>) -> PlanState {
    let plan = PlanDescriptor::new("crashed", "crashed")
        .task(TaskDescriptor::new("a"))
        .task(TaskDescriptor::new("b").depends_on("a"))
        .task(TaskDescriptor::new("c").depends_on("b"))
        .into_plan("local".to_string(), &RetryPolicy::default())
        .unwrap();
    let mut state = PlanState::new(plan);
    state.plan.status = PlanStatus::Running;

    let a = &mut state.plan.tasks[0];
    a.status = TaskStatus::Succeeded;
    a.attempt_count = 1;
    a.result = Some(TaskResult::succeeded(
        TaskId::from("a"),
        1,
        json!({ "ran": "a", "before": "crash" }),
        SystemTime::now(),
    ));

    let b = &mut state.plan.tasks[1];
    b.status = TaskStatus::Dispatched;
    b.attempt_count = 1;
    b.dispatched_at = Some(SystemTime::now());
    b.handle = b_handle.map(|handle| TaskHandle { attempt: 1, handle });
    state
}

fn b_request() -> DispatchRequest {
    DispatchRequest {
        key: IdempotencyKey::new(PlanId::from("crashed"), TaskId::from("b"), 1),
        payload: json!(null),
        timeout: None,
    }
}

fn restart(
    adapter: &LocalExecutionAdapter,
    store: &Arc<InMemoryStateStore>,
    resume_policy: ResumePolicy,
) -> Orchestrator {
    let registry = AdapterRegistry::new()
        .with_adapter(Arc::new(adapter.clone()))
        .unwrap();
    let config = OrchestratorConfig::default()
        .poll_interval(Duration::from_millis(5))
        .resume_policy(resume_policy);
    Orchestrator::new(registry, store.clone(), config).unwrap()
}

async fn wait_until(
    orchestrator: &Orchestrator,
    plan_id: &PlanId,
    predicate: impl Fn(&PlanState) -> bool,
) -> PlanState {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = orchestrator.get_plan(plan_id).await.unwrap();
        if predicate(&state) {
            return state;
        }
        assert!(Instant::now() < deadline, "condition not reached: {state:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn assert_a_untouched(state: &PlanState) {
    let a = state.task(&TaskId::from("a")).unwrap();
    assert_eq!(a.status, TaskStatus::Succeeded);
    assert_eq!(a.attempt_count, 1);
    assert_eq!(
        a.result.as_ref().unwrap().output,
        json!({ "ran": "a", "before": "crash" })
    );
}

#[tokio::test]
async fn stored_handle_is_requeried_instead_of_redispatched() {
    let adapter = adapter();
    let handle = adapter.dispatch(b_request()).await.unwrap();

    let store = Arc::new(InMemoryStateStore::new());
    store.create_plan(&crashed_state(Some(handle))).unwrap();

    let orchestrator = restart(&adapter, &store, ResumePolicy::default());
    let recovered = orchestrator.recover().await.unwrap();
    assert_eq!(recovered, vec![PlanId::from("crashed")]);

    let state = orchestrator
        .wait_for_terminal(&PlanId::from("crashed"), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status(), PlanStatus::Completed);
    assert_a_untouched(&state);

    let b = state.task(&TaskId::from("b")).unwrap();
    assert_eq!(b.attempt_count, 1);
    assert_eq!(b.result.as_ref().unwrap().output, json!({ "ran": "b", "attempt": 1 }));
    // b ran once before the crash, c once after it.
    assert_eq!(adapter.effect_count().await, 2);
}

#[tokio::test]
async fn missing_handle_is_redispatched_under_the_same_key() {
    let adapter = adapter();
    // The backend accepted b before the crash, but the handle never reached
    // the store.
    adapter.dispatch(b_request()).await.unwrap();

    let store = Arc::new(InMemoryStateStore::new());
    store.create_plan(&crashed_state(None)).unwrap();

    let orchestrator = restart(&adapter, &store, ResumePolicy::default());
    orchestrator.resume_plan(&PlanId::from("crashed")).await.unwrap();

    let state = orchestrator
        .wait_for_terminal(&PlanId::from("crashed"), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status(), PlanStatus::Completed);
    assert_a_untouched(&state);
    assert_eq!(state.task(&TaskId::from("b")).unwrap().attempt_count, 1);
    assert_eq!(adapter.effect_count().await, 2);
}

#[tokio::test]
async fn handle_unknown_to_the_backend_falls_back_to_redispatch() {
    let adapter = adapter();
    let store = Arc::new(InMemoryStateStore::new());
    store
        .create_plan(&crashed_state(Some(AdapterHandle::new("lost-handle"))))
        .unwrap();

    let orchestrator = restart(&adapter, &store, ResumePolicy::default());
    orchestrator.recover().await.unwrap();

    let state = orchestrator
        .wait_for_terminal(&PlanId::from("crashed"), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status(), PlanStatus::Completed);
    assert_a_untouched(&state);
    assert_eq!(state.task(&TaskId::from("b")).unwrap().attempt_count, 1);
}

#[tokio::test]
async fn manual_intervention_waits_for_an_operator() {
    let adapter = adapter();
    let store = Arc::new(InMemoryStateStore::new());
    store.create_plan(&crashed_state(None)).unwrap();

    let policy = ResumePolicy {
        requery_handles: true,
        fallback: ResumeFallback::ManualIntervention,
    };
    let orchestrator = restart(&adapter, &store, policy);
    let plan_id = PlanId::from("crashed");
    orchestrator.recover().await.unwrap();

    let state = wait_until(&orchestrator, &plan_id, |state| {
        state
            .task(&TaskId::from("b"))
            .is_some_and(|task| task.needs_intervention)
    })
    .await;
    assert_eq!(state.status(), PlanStatus::Running);
    assert_eq!(adapter.effect_count().await, 0);

    orchestrator
        .resolve_task(
            &plan_id,
            &TaskId::from("b"),
            ManualResolution::MarkSucceeded {
                output: json!({ "confirmed": "by operator" }),
            },
        )
        .await
        .unwrap();

    let state = orchestrator
        .wait_for_terminal(&plan_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status(), PlanStatus::Completed);
    assert_a_untouched(&state);
    assert_eq!(
        state.task(&TaskId::from("b")).unwrap().result.as_ref().unwrap().output,
        json!({ "confirmed": "by operator" })
    );
    // Only c ran.
    assert_eq!(adapter.effect_count().await, 1);
}

#[tokio::test]
async fn operator_can_fail_a_task_of_unknown_outcome() {
    let adapter = adapter();
    let store = Arc::new(InMemoryStateStore::new());
    store.create_plan(&crashed_state(None)).unwrap();

    let policy = ResumePolicy {
        requery_handles: false,
        fallback: ResumeFallback::ManualIntervention,
    };
    let orchestrator = restart(&adapter, &store, policy);
    let plan_id = PlanId::from("crashed");
    orchestrator.resume_plan(&plan_id).await.unwrap();

    wait_until(&orchestrator, &plan_id, |state| {
        state
            .task(&TaskId::from("b"))
            .is_some_and(|task| task.needs_intervention)
    })
    .await;

    orchestrator
        .resolve_task(
            &plan_id,
            &TaskId::from("b"),
            ManualResolution::MarkFailed {
                reason: "side effect was never observed".to_string(),
            },
        )
        .await
        .unwrap();

    let state = orchestrator
        .wait_for_terminal(&plan_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(state.status(), PlanStatus::Failed);
    assert_a_untouched(&state);
    assert_eq!(state.task(&TaskId::from("c")).unwrap().status, TaskStatus::Blocked);
    let failure = state.first_failure.unwrap();
    assert_eq!(failure.task_id, TaskId::from("b"));
    assert_eq!(failure.error.message, "side effect was never observed");
}

#[tokio::test]
async fn recover_skips_terminal_plans() {
    let adapter = adapter();
    let store = Arc::new(InMemoryStateStore::new());
    let mut finished = crashed_state(None);
    finished.plan.id = PlanId::from("finished");
    finished.plan.status = PlanStatus::Completed;
    store.create_plan(&finished).unwrap();

    let orchestrator = restart(&adapter, &store, ResumePolicy::default());
    assert!(orchestrator.recover().await.unwrap().is_empty());

    let state = orchestrator.resume_plan(&PlanId::from("finished")).await.unwrap();
    assert_eq!(state.status(), PlanStatus::Completed);
    assert_eq!(adapter.effect_count().await, 0);
}
