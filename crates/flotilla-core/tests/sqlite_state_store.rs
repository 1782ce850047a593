use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flotilla_core::adapters::LocalExecutionAdapter;
use flotilla_core::models::{
    CoreErrorKind, EventCursor, PlanDescriptor, PlanEvent, PlanEventKind, PlanId, PlanState,
    PlanStatus, RetryPolicy, TaskDescriptor, TaskId,
};
use flotilla_core::orchestration::{Orchestrator, OrchestratorConfig};
use flotilla_core::persistence::{MigrationStore, StateStore};
use flotilla_core::registry::AdapterRegistry;
use flotilla_core::sqlite::{SqliteStateStore, current_schema_version, migration, migrations};
use serde_json::json;

fn temp_db_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("flotilla-{name}-{nanos}.sqlite3"))
}

fn migrated_store(name: &str) -> SqliteStateStore {
    let store = SqliteStateStore::new(temp_db_path(name));
    store.migrate_to_latest().unwrap();
    store
}

fn plan_state(id: &str) -> PlanState {
    let plan = PlanDescriptor::new(id, id)
        .task(TaskDescriptor::new("a"))
        .task(TaskDescriptor::new("b").depends_on("a"))
        .into_plan("local".to_string(), &RetryPolicy::default())
        .unwrap();
    PlanState::new(plan)
}

#[test]
fn migrations_are_ordered_and_complete() {
    let versions: Vec<i64> = migrations().iter().map(|entry| entry.version).collect();
    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(versions.first(), Some(&1));

    let latest = migration(current_schema_version()).unwrap();
    assert!(!latest.up_sql.trim().is_empty());
    assert!(!latest.down_sql.trim().is_empty());
    assert!(migrations().iter().all(|entry| !entry.name.is_empty()));
}

#[test]
fn migrate_to_latest_is_idempotent_and_reversible() {
    let path = temp_db_path("migrations");
    let store = SqliteStateStore::new(&path);
    assert_eq!(store.current_version().unwrap(), 0);
    assert_eq!(store.planned_migrations(0).len(), migrations().len());

    store.migrate_to_latest().unwrap();
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());
    assert!(store.planned_migrations(current_schema_version()).is_empty());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    let error = store.apply_migration(current_schema_version() + 1).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    let _ = std::fs::remove_file(path);
}

#[test]
fn plan_operations_require_a_migrated_schema() {
    let path = temp_db_path("unmigrated");
    let store = SqliteStateStore::new(&path);
    let error = store.create_plan(&plan_state("early")).unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    let _ = std::fs::remove_file(path);
}

#[test]
fn versioned_writes_detect_conflicts() {
    let store = migrated_store("versions");
    let state = plan_state("versioned");

    assert_eq!(store.create_plan(&state).unwrap(), 1);
    let duplicate = store.create_plan(&state).unwrap_err();
    assert_eq!(duplicate.kind, CoreErrorKind::Conflict);

    let mut loaded = store.load_plan(&PlanId::from("versioned")).unwrap().unwrap();
    assert_eq!(loaded.version, 1);
    let stale = loaded.clone();

    loaded.plan.status = PlanStatus::Running;
    assert_eq!(store.save_plan(&loaded).unwrap(), 2);

    let conflict = store.save_plan(&stale).unwrap_err();
    assert_eq!(conflict.kind, CoreErrorKind::Conflict);

    let stored = store.load_plan(&PlanId::from("versioned")).unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.status(), PlanStatus::Running);
    assert_eq!(stored.plan.tasks.len(), 2);

    let mut missing = plan_state("missing");
    missing.version = 1;
    assert_eq!(store.save_plan(&missing).unwrap_err().kind, CoreErrorKind::NotFound);
    assert!(store.load_plan(&PlanId::from("missing")).unwrap().is_none());

    let _ = std::fs::remove_file(store.database_path());
}

#[test]
fn trace_sequences_are_per_plan_and_readable_after_a_cursor() {
    let store = migrated_store("trace");
    let first = PlanId::from("first");
    let second = PlanId::from("second");

    for kind in [
        PlanEventKind::PlanSubmitted,
        PlanEventKind::PlanStarted,
        PlanEventKind::PlanCompleted,
    ] {
        store.append_trace(&PlanEvent::plan(&first, kind)).unwrap();
    }
    let sequence = store
        .append_trace(
            &PlanEvent::task(&second, &TaskId::from("a"), PlanEventKind::TaskFailed)
                .attempt(2)
                .error("boom"),
        )
        .unwrap();
    assert_eq!(sequence, 1);

    let all = store.read_trace(&first, EventCursor::default(), 100).unwrap();
    let sequences: Vec<u64> = all.iter().map(|event| event.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let rest = store.read_trace(&first, EventCursor(1), 100).unwrap();
    let kinds: Vec<PlanEventKind> = rest.iter().map(|event| event.kind).collect();
    assert_eq!(kinds, vec![PlanEventKind::PlanStarted, PlanEventKind::PlanCompleted]);

    let page = store.read_trace(&first, EventCursor::default(), 2).unwrap();
    assert_eq!(page.len(), 2);

    let failed = store.read_trace(&second, EventCursor::default(), 100).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].task_id, Some(TaskId::from("a")));
    assert_eq!(failed[0].attempt, Some(2));
    assert_eq!(failed[0].error.as_deref(), Some("boom"));

    let _ = std::fs::remove_file(store.database_path());
}

#[test]
fn active_plans_exclude_terminal_ones() {
    let store = migrated_store("active");
    store.create_plan(&plan_state("b-running")).unwrap();
    store.create_plan(&plan_state("a-created")).unwrap();

    let mut done = plan_state("done");
    done.plan.status = PlanStatus::Completed;
    store.create_plan(&done).unwrap();

    assert_eq!(
        store.list_active_plans().unwrap(),
        vec![PlanId::from("a-created"), PlanId::from("b-running")]
    );
    let _ = std::fs::remove_file(store.database_path());
}

#[tokio::test]
async fn plans_survive_a_restart_of_the_orchestrator() {
    let store = Arc::new(migrated_store("restart"));
    let adapter = LocalExecutionAdapter::new("local", |request, _token| async move {
        Ok(json!({ "task": request.key.task_id.0 }))
    });
    let config = OrchestratorConfig::default().poll_interval(Duration::from_millis(5));

    let plan_id = {
        let registry = AdapterRegistry::new()
            .with_adapter(Arc::new(adapter.clone()))
            .unwrap();
        let orchestrator = Orchestrator::new(registry, store.clone(), config.clone()).unwrap();
        let plan_id = orchestrator
            .submit_plan(
                PlanDescriptor::new("durable", "durable")
                    .task(TaskDescriptor::new("a"))
                    .task(TaskDescriptor::new("b").depends_on("a")),
            )
            .await
            .unwrap();
        let state = orchestrator
            .wait_for_terminal(&plan_id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(state.status(), PlanStatus::Completed);
        plan_id
    };

    let reopened = Arc::new(SqliteStateStore::new(store.database_path()));
    let registry = AdapterRegistry::new()
        .with_adapter(Arc::new(adapter))
        .unwrap();
    let orchestrator = Orchestrator::new(registry, reopened, config).unwrap();
    assert!(orchestrator.recover().await.unwrap().is_empty());

    let report = orchestrator.plan_report(&plan_id).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.outputs[&TaskId::from("b")], json!({ "task": "b" }));

    let events = orchestrator
        .stream_plan_events(&plan_id, None)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(events.first().unwrap().kind, PlanEventKind::PlanSubmitted);
    assert_eq!(events.last().unwrap().kind, PlanEventKind::PlanCompleted);

    let _ = std::fs::remove_file(store.database_path());
}
