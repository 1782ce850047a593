use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot};

use crate::adapters::{PushedResult, ResultSink};
use crate::models::{
    CoreError, CoreErrorKind, EventCursor, PlanDescriptor, PlanEvent, PlanId, PlanReport,
    PlanState, TaskId,
};
use crate::orchestration::resolution::apply_resolution;
use crate::orchestration::scheduler::{
    WorkerContext, WorkerHandle, WorkerMessage, WorkerStart, spawn_worker,
};
use crate::orchestration::store_calls::call_store;
use crate::orchestration::{
    DependencyGraph, EventBus, ManualResolution, MetricsSnapshot, OrchestrationResult,
    OrchestratorConfig, PlanEventStream,
};
use crate::persistence::StateStore;
use crate::registry::{AdapterRegistry, RegisteredAdapter};

/// Entry point for submitting and supervising plans. Cloning is cheap; all
/// clones share the same workers, store and event bus.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    registry: AdapterRegistry,
    backends: BTreeMap<String, RegisteredAdapter>,
    store: Arc<dyn StateStore>,
    config: Arc<OrchestratorConfig>,
    bus: EventBus,
    workers: Mutex<HashMap<PlanId, WorkerHandle>>,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime: push-capable adapters get
    /// a result sink whose deliveries are routed by a background task.
    pub fn new(
        registry: AdapterRegistry,
        store: Arc<dyn StateStore>,
        config: OrchestratorConfig,
    ) -> OrchestrationResult<Self> {
        config.validate()?;
        if registry.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "at least one execution adapter must be registered",
            ));
        }

        let bus = EventBus::new(config.event_buffer);
        let backends = registry.bind(&config.health);
        let inner = Arc::new(OrchestratorInner {
            registry,
            backends,
            store,
            config: Arc::new(config),
            bus,
            workers: Mutex::new(HashMap::new()),
        });

        let (push_sender, push_receiver) = mpsc::unbounded_channel();
        for registered in inner.backends.values() {
            if registered.adapter.capabilities().push {
                registered
                    .adapter
                    .attach_sink(ResultSink::new(push_sender.clone()));
            }
        }
        drop(push_sender);
        tokio::spawn(route_pushed_results(Arc::downgrade(&inner), push_receiver));

        Ok(Self { inner })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Validates the descriptor, persists the initial plan state and starts
    /// its worker, which records `plan_submitted` as its first event. Returns
    /// without waiting for any task. A failed `create_plan` leaves nothing
    /// behind.
    pub async fn submit_plan(&self, descriptor: PlanDescriptor) -> OrchestrationResult<PlanId> {
        let config = &self.inner.config;
        let backend = self
            .inner
            .registry
            .resolve_kind(descriptor.backend.as_deref(), config.default_backend.as_deref())
            .map_err(|error| error.for_plan(&descriptor.id))?;
        let plan = descriptor.into_plan(backend, &config.default_retry_policy)?;
        let plan_id = plan.id.clone();

        let graph =
            DependencyGraph::build(&plan.tasks).map_err(|error| error.for_plan(&plan_id))?;
        graph
            .validate_acyclic()
            .map_err(|error| error.for_plan(&plan_id))?;

        let mut state = PlanState::new(plan);
        let initial = state.clone();
        state.version = self
            .store_call("create_plan", move |store| store.create_plan(&initial))
            .await?;

        tracing::info!(
            plan_id = %plan_id,
            backend = %state.plan.backend,
            tasks = state.plan.tasks.len(),
            "plan submitted"
        );

        let mut workers = self.inner.workers.lock().await;
        let handle = self.spawn(state, WorkerStart::Submitted)?;
        workers.insert(plan_id.clone(), handle);
        Ok(plan_id)
    }

    pub async fn get_plan(&self, plan_id: &PlanId) -> OrchestrationResult<PlanState> {
        let id = plan_id.clone();
        self.store_call("load_plan", move |store| store.load_plan(&id))
            .await?
            .ok_or_else(|| not_found(plan_id))
    }

    pub async fn plan_report(&self, plan_id: &PlanId) -> OrchestrationResult<PlanReport> {
        let state = self.get_plan(plan_id).await?;
        Ok(PlanReport::from_state(&state))
    }

    /// Requests cancellation and waits for the plan to settle. The worker
    /// bounds the wait by the configured cancellation timeout.
    pub async fn cancel_plan(&self, plan_id: &PlanId) -> OrchestrationResult<PlanState> {
        let state = self.get_plan(plan_id).await?;
        if state.is_terminal() {
            return Ok(state);
        }

        {
            let mut workers = self.inner.workers.lock().await;
            let inbox = match workers.get(plan_id).filter(|handle| handle.is_running()) {
                Some(handle) => handle.inbox.clone(),
                None => {
                    let handle = self.spawn(state, WorkerStart::Resumed)?;
                    let inbox = handle.inbox.clone();
                    workers.insert(plan_id.clone(), handle);
                    inbox
                }
            };
            inbox.send(WorkerMessage::Cancel).map_err(|_| worker_gone(plan_id))?;
        }

        self.wait_for_terminal(plan_id, None).await
    }

    /// Restarts the worker of a non-terminal plan that has none, e.g. after
    /// a process restart. Returns the plan as stored.
    pub async fn resume_plan(&self, plan_id: &PlanId) -> OrchestrationResult<PlanState> {
        let state = self.get_plan(plan_id).await?;
        if state.is_terminal() {
            return Ok(state);
        }

        let mut workers = self.inner.workers.lock().await;
        if workers.get(plan_id).is_some_and(WorkerHandle::is_running) {
            return Ok(state);
        }
        let handle = self.spawn(state.clone(), WorkerStart::Resumed)?;
        workers.insert(plan_id.clone(), handle);
        Ok(state)
    }

    /// Resumes every non-terminal plan found in the store.
    pub async fn recover(&self) -> OrchestrationResult<Vec<PlanId>> {
        let active = self
            .store_call("list_active_plans", |store| store.list_active_plans())
            .await?;
        for plan_id in &active {
            self.resume_plan(plan_id).await?;
        }
        if !active.is_empty() {
            tracing::info!(plans = active.len(), "recovered active plans");
        }
        Ok(active)
    }

    pub async fn resolve_task(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
        resolution: ManualResolution,
    ) -> OrchestrationResult<PlanState> {
        let mut workers = self.inner.workers.lock().await;
        let live = workers
            .get(plan_id)
            .filter(|handle| handle.accepts_messages())
            .map(|handle| handle.inbox.clone());
        if let Some(inbox) = live {
            let (reply, response) = oneshot::channel();
            let sent = inbox.send(WorkerMessage::Resolve {
                task_id: task_id.clone(),
                resolution: resolution.clone(),
                reply,
            });
            if sent.is_ok() {
                drop(workers);
                if let Ok(outcome) = response.await {
                    outcome?;
                    return self.get_plan(plan_id).await;
                }
                // The worker finished the plan before reading the request.
                workers = self.inner.workers.lock().await;
            }
        }

        let mut state = self.get_plan(plan_id).await?;
        let was_terminal = state.is_terminal();
        let graph =
            DependencyGraph::build(&state.plan.tasks).map_err(|error| error.for_plan(plan_id))?;
        let events = apply_resolution(
            &mut state,
            &graph,
            task_id,
            resolution,
            self.inner.config.blocked_dependents,
            self.inner.config.failure_policy,
        )?;

        state.updated_at = std::time::SystemTime::now();
        let snapshot = state.clone();
        state.version = self
            .store_call("save_plan", move |store| store.save_plan(&snapshot))
            .await?;
        self.inner
            .bus
            .record(&self.inner.store, self.inner.config.persistence_retry, events)
            .await?;
        tracing::info!(plan_id = %plan_id, task_id = %task_id, "task resolved manually");

        if !state.is_terminal() {
            let start = if was_terminal {
                WorkerStart::Fresh
            } else {
                WorkerStart::Resumed
            };
            let handle = self.spawn(state.clone(), start)?;
            workers.insert(plan_id.clone(), handle);
        }
        Ok(state)
    }

    /// Lazily reads the plan's events after `cursor` (from the start when
    /// `None`) and ends after the terminal plan event.
    pub async fn stream_plan_events(
        &self,
        plan_id: &PlanId,
        cursor: Option<EventCursor>,
    ) -> OrchestrationResult<PlanEventStream> {
        // Subscribe before the existence check so no wake-up is missed.
        let receiver = self.inner.bus.subscribe();
        self.get_plan(plan_id).await?;
        Ok(PlanEventStream::new(
            plan_id.clone(),
            self.inner.store.clone(),
            self.inner.config.persistence_retry,
            receiver,
            cursor.unwrap_or_default(),
            self.inner.config.poll_interval,
        ))
    }

    /// Waits until the plan reaches a terminal status. Fails with `Timeout`
    /// when `timeout` elapses first.
    pub async fn wait_for_terminal(
        &self,
        plan_id: &PlanId,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<PlanState> {
        let snapshot = {
            let workers = self.inner.workers.lock().await;
            workers.get(plan_id).map(|handle| handle.snapshot.clone())
        };

        let waiting = async {
            if let Some(mut snapshot) = snapshot
                && let Ok(state) = snapshot.wait_for(PlanState::is_terminal).await
            {
                return Ok(state.clone());
            }
            let state = self.get_plan(plan_id).await?;
            if state.is_terminal() {
                Ok(state)
            } else {
                Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("plan '{plan_id}' is not running; resume it before waiting"),
                )
                .for_plan(plan_id))
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, waiting).await.map_err(|_| {
                CoreError::new(
                    CoreErrorKind::Timeout,
                    format!("plan '{plan_id}' did not finish within {} ms", limit.as_millis()),
                )
                .for_plan(plan_id)
            })?,
            None => waiting.await,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.inner.bus.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.bus.metrics().snapshot()
    }

    fn spawn(&self, state: PlanState, start: WorkerStart) -> OrchestrationResult<WorkerHandle> {
        let backend = self
            .inner
            .backends
            .get(&state.plan.backend)
            .cloned()
            .ok_or_else(|| {
                CoreError::unavailable(format!(
                    "no execution adapter is registered for backend '{}'",
                    state.plan.backend
                ))
                .for_plan(state.id())
            })?;
        spawn_worker(
            WorkerContext {
                store: self.inner.store.clone(),
                backend,
                config: self.inner.config.clone(),
                bus: self.inner.bus.clone(),
            },
            state,
            start,
        )
    }

    async fn store_call<T, F>(&self, operation: &'static str, call: F) -> OrchestrationResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn StateStore) -> crate::persistence::PersistenceResult<T> + Send + Sync + 'static,
    {
        call_store(
            &self.inner.store,
            self.inner.config.persistence_retry,
            operation,
            call,
        )
        .await
    }
}

async fn route_pushed_results(
    inner: Weak<OrchestratorInner>,
    mut receiver: mpsc::UnboundedReceiver<PushedResult>,
) {
    while let Some(pushed) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let workers = inner.workers.lock().await;
        let delivered = workers
            .get(&pushed.key.plan_id)
            .filter(|handle| handle.is_running())
            .map(|handle| {
                handle
                    .inbox
                    .send(WorkerMessage::Result {
                        key: pushed.key.clone(),
                        handle: Some(pushed.handle.clone()),
                        result: pushed.result.clone(),
                    })
                    .is_ok()
            })
            .unwrap_or(false);
        if !delivered {
            tracing::debug!(
                plan_id = %pushed.key.plan_id,
                key = %pushed.key,
                "pushed result has no running worker; dropped"
            );
        }
    }
}

fn not_found(plan_id: &PlanId) -> CoreError {
    CoreError::new(
        CoreErrorKind::NotFound,
        format!("plan '{plan_id}' does not exist"),
    )
    .for_plan(plan_id)
}

fn worker_gone(plan_id: &PlanId) -> CoreError {
    CoreError::new(
        CoreErrorKind::Internal,
        format!("worker of plan '{plan_id}' stopped unexpectedly"),
    )
    .for_plan(plan_id)
}
