use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, Id as TaskRunId, JoinError, JoinSet};
use tokio::time::Instant;

use crate::adapters::{AdapterHealth, AdapterResult, DispatchRequest, ExecutionAdapter, PollOutcome};
use crate::models::{
    AdapterHandle, CancelReason, CoreError, CoreErrorKind, ErrorClass, EventCursor,
    ExecutionError, FailureSummary, IdempotencyKey, PlanEvent, PlanEventKind, PlanId, PlanState,
    PlanStatus, TaskHandle, TaskId, TaskOutcome, TaskResult, TaskStatus,
};
use crate::orchestration::resolution::{ManualResolution, apply_resolution};
use crate::orchestration::store_calls::call_store;
use crate::orchestration::{
    DependencyGraph, EventBus, FailurePolicy, OrchestrationResult, OrchestratorConfig,
    ResumeFallback,
};
use crate::persistence::StateStore;
use crate::registry::RegisteredAdapter;

const IDLE_WAKEUP: Duration = Duration::from_secs(60);

pub(crate) enum WorkerMessage {
    Result {
        key: IdempotencyKey,
        handle: Option<AdapterHandle>,
        result: TaskResult,
    },
    HandleLost {
        key: IdempotencyKey,
    },
    Cancel,
    Resolve {
        task_id: TaskId,
        resolution: ManualResolution,
        reply: oneshot::Sender<OrchestrationResult<()>>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WorkerStart {
    /// A newly submitted plan; the worker records `plan_submitted` first.
    Submitted,
    Fresh,
    Resumed,
}

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn StateStore>,
    pub backend: RegisteredAdapter,
    pub config: Arc<OrchestratorConfig>,
    pub bus: EventBus,
}

pub(crate) struct WorkerHandle {
    pub inbox: mpsc::UnboundedSender<WorkerMessage>,
    pub snapshot: watch::Receiver<PlanState>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        !self.inbox.is_closed()
    }

    /// A worker stops reading its inbox once it has published a terminal
    /// snapshot.
    pub fn accepts_messages(&self) -> bool {
        self.is_running() && !self.snapshot.borrow().is_terminal()
    }
}

/// Spawns the single writer of one plan. The worker exits once the plan is
/// terminal, or after a persistence failure, leaving the plan resumable.
pub(crate) fn spawn_worker(
    context: WorkerContext,
    state: PlanState,
    start: WorkerStart,
) -> OrchestrationResult<WorkerHandle> {
    let graph =
        DependencyGraph::build(&state.plan.tasks).map_err(|error| error.for_plan(state.id()))?;
    let (inbox_sender, inbox) = mpsc::unbounded_channel();
    let (snapshot_sender, snapshot) = watch::channel(state.clone());

    let worker = PlanWorker {
        context,
        state,
        graph,
        inbox,
        inbox_sender: inbox_sender.clone(),
        pollers: HashMap::new(),
        dispatches: JoinSet::new(),
        dispatching: HashMap::new(),
        ingested: HashSet::new(),
        reuse_attempt: HashSet::new(),
        cancel_deadline: None,
        snapshot: snapshot_sender,
        rng: StdRng::from_entropy(),
        pending_events: Vec::new(),
        dirty: false,
    };
    tokio::spawn(worker.run(start));

    Ok(WorkerHandle {
        inbox: inbox_sender,
        snapshot,
    })
}

struct PlanWorker {
    context: WorkerContext,
    state: PlanState,
    graph: DependencyGraph,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    inbox_sender: mpsc::UnboundedSender<WorkerMessage>,
    pollers: HashMap<usize, AbortHandle>,
    /// Dispatch calls run detached so a slow backend never stalls the inbox.
    dispatches: JoinSet<AdapterResult<AdapterHandle>>,
    dispatching: HashMap<TaskRunId, InFlightDispatch>,
    ingested: HashSet<IdempotencyKey>,
    /// Tasks to dispatch again under their current attempt number.
    reuse_attempt: HashSet<usize>,
    cancel_deadline: Option<Instant>,
    snapshot: watch::Sender<PlanState>,
    rng: StdRng,
    pending_events: Vec<PlanEvent>,
    dirty: bool,
}

#[derive(Clone, Copy, Debug)]
struct InFlightDispatch {
    index: usize,
    attempt: u32,
    reused: bool,
}

impl PlanWorker {
    async fn run(mut self, start: WorkerStart) {
        let plan_id = self.state.id().clone();
        tracing::debug!(plan_id = %plan_id, start = ?start, "plan worker started");

        if let Err(error) = self.drive(start).await {
            tracing::error!(
                plan_id = %plan_id,
                kind = ?error.kind,
                message = %error.message,
                "plan worker stopped; plan remains resumable"
            );
        }

        for (_, poller) in self.pollers.drain() {
            poller.abort();
        }
        self.dispatches.abort_all();
        tracing::debug!(plan_id = %plan_id, status = ?self.state.status(), "plan worker exited");
    }

    async fn drive(&mut self, start: WorkerStart) -> OrchestrationResult<()> {
        match start {
            WorkerStart::Submitted => {
                let event = PlanEvent::plan(self.plan_id(), PlanEventKind::PlanSubmitted);
                self.emit(event);
            }
            WorkerStart::Fresh => {}
            WorkerStart::Resumed => {
                if self.trace_is_empty().await? {
                    let event = PlanEvent::plan(self.plan_id(), PlanEventKind::PlanSubmitted);
                    self.emit(event);
                }
                self.resume_in_flight();
            }
        }

        loop {
            self.advance().await?;
            if self.state.is_terminal() {
                return Ok(());
            }

            let wakeup = self.next_wakeup();
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message).await?,
                    None => return Ok(()),
                },
                Some(joined) = self.dispatches.join_next_with_id(),
                    if !self.dispatches.is_empty() => self.dispatch_returned(joined),
                _ = tokio::time::sleep_until(wakeup) => self.handle_timers(),
            }
        }
    }

    /// A plan whose submission trace never made it to the store gets it on
    /// the first resume.
    async fn trace_is_empty(&self) -> OrchestrationResult<bool> {
        let plan_id = self.plan_id().clone();
        let first = call_store(
            &self.context.store,
            self.context.config.persistence_retry,
            "read_trace",
            move |store| store.read_trace(&plan_id, EventCursor::default(), 1),
        )
        .await?;
        Ok(first.is_empty())
    }

    fn plan_id(&self) -> &PlanId {
        self.state.id()
    }

    fn emit(&mut self, event: PlanEvent) {
        self.pending_events.push(event);
        self.dirty = true;
    }

    fn task_event(&self, index: usize, kind: PlanEventKind) -> PlanEvent {
        let task = &self.state.plan.tasks[index];
        PlanEvent::task(self.state.id(), &task.id, kind)
    }

    fn key_for(&self, index: usize) -> IdempotencyKey {
        let task = &self.state.plan.tasks[index];
        IdempotencyKey::new(self.state.id().clone(), task.id.clone(), task.attempt_count)
    }

    fn in_flight(&self) -> usize {
        self.state
            .plan
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Dispatched && !task.needs_intervention)
            .count()
    }

    fn concurrency_limit(&self) -> usize {
        self.state
            .plan
            .max_concurrency
            .unwrap_or(self.context.config.max_concurrency)
            .max(1)
    }

    /// One scheduling pass followed by a commit of whatever changed.
    async fn advance(&mut self) -> OrchestrationResult<()> {
        if !self.state.is_terminal() && self.state.status() != PlanStatus::Cancelling {
            self.promote_ready();
            self.refresh_stall().await;
            if !self.state.stalled {
                self.dispatch_ready().await?;
            }
        }
        self.try_finish();
        self.commit().await
    }

    fn promote_ready(&mut self) {
        let now = SystemTime::now();
        for index in self.graph.ready_set(&self.state.plan.tasks, now) {
            let task = &mut self.state.plan.tasks[index];
            task.status = TaskStatus::Ready;
            task.retry_at = None;
            let event = self.task_event(index, PlanEventKind::TaskReady);
            self.emit(event);
        }
    }

    fn has_dispatchable(&self) -> bool {
        self.state
            .plan
            .tasks
            .iter()
            .any(|task| task.status == TaskStatus::Ready)
    }

    async fn refresh_stall(&mut self) {
        let health = self.context.backend.health.clone();
        let mut available = health.is_available();

        if available && self.has_dispatchable() {
            match self.context.backend.adapter.health().await {
                Ok(AdapterHealth::Healthy) => {}
                Ok(AdapterHealth::Unhealthy { reason }) => {
                    tracing::warn!(
                        plan_id = %self.plan_id(),
                        backend = %self.state.plan.backend,
                        reason = %reason,
                        "execution backend reported unhealthy"
                    );
                    health.mark_unhealthy();
                    available = false;
                }
                Err(error) => {
                    tracing::warn!(
                        plan_id = %self.plan_id(),
                        backend = %self.state.plan.backend,
                        kind = ?error.kind,
                        message = %error.message,
                        "execution backend health check failed"
                    );
                    if health.record_failure() {
                        available = false;
                    }
                }
            }
        }

        // Only a plan with work held back by the backend counts as stalled.
        let held_back = !available && self.has_dispatchable();
        if held_back && !self.state.stalled {
            self.state.stalled = true;
            tracing::warn!(
                plan_id = %self.plan_id(),
                backend = %self.state.plan.backend,
                "plan stalled; backend unavailable"
            );
            let event = PlanEvent::plan(self.plan_id(), PlanEventKind::PlanStalled);
            self.emit(event);
        } else if !held_back && self.state.stalled {
            self.state.stalled = false;
            tracing::info!(plan_id = %self.plan_id(), available, "plan no longer stalled");
            let event = PlanEvent::plan(self.plan_id(), PlanEventKind::PlanUnstalled);
            self.emit(event);
        }
    }

    fn dispatchable_now(&self, now: SystemTime, limit: usize) -> Vec<usize> {
        (0..self.state.plan.tasks.len())
            .filter(|&index| {
                let task = &self.state.plan.tasks[index];
                task.status == TaskStatus::Ready && !task.is_backing_off(now)
            })
            .take(limit)
            .collect()
    }

    async fn dispatch_ready(&mut self) -> OrchestrationResult<()> {
        let now = SystemTime::now();
        let available = self.concurrency_limit().saturating_sub(self.in_flight());
        if available == 0 || self.dispatchable_now(now, available).is_empty() {
            return Ok(());
        }

        self.adopt_stored_handles().await?;
        let available = self.concurrency_limit().saturating_sub(self.in_flight());
        let selected = self.dispatchable_now(now, available);
        if selected.is_empty() {
            return Ok(());
        }

        if self.state.status() == PlanStatus::Created {
            self.state.plan.status = PlanStatus::Running;
            tracing::info!(plan_id = %self.plan_id(), "plan started");
            let event = PlanEvent::plan(self.plan_id(), PlanEventKind::PlanStarted);
            self.emit(event);
        }

        let mut batch = Vec::with_capacity(selected.len());
        for index in selected {
            let reused = self.reuse_attempt.remove(&index);
            let task = &mut self.state.plan.tasks[index];
            if !reused {
                task.attempt_count = task.attempt_count.saturating_add(1);
            }
            task.status = TaskStatus::Dispatched;
            task.dispatched_at = Some(now);
            task.handle = None;
            task.result = None;
            task.retry_at = None;
            let request = DispatchRequest {
                key: self.key_for(index),
                payload: task_payload(&self.state, index),
                timeout: self.state.plan.tasks[index].timeout,
            };
            let event = self
                .task_event(index, PlanEventKind::TaskDispatched)
                .attempt(request.key.attempt);
            self.emit(event);
            let dispatch = InFlightDispatch {
                index,
                attempt: request.key.attempt,
                reused,
            };
            batch.push((dispatch, request));
        }

        // Dispatched is durable before the backend sees the request.
        self.commit().await?;

        for (dispatch, request) in batch {
            let adapter = self.context.backend.adapter.clone();
            let started = self
                .dispatches
                .spawn(async move { adapter.dispatch(request).await });
            self.dispatching.insert(started.id(), dispatch);
        }
        Ok(())
    }

    fn dispatch_returned(
        &mut self,
        joined: Result<(TaskRunId, AdapterResult<AdapterHandle>), JoinError>,
    ) {
        let (id, outcome) = match joined {
            Ok(returned) => returned,
            Err(join_error) if join_error.is_cancelled() => {
                self.dispatching.remove(&join_error.id());
                return;
            }
            Err(join_error) => {
                tracing::error!(
                    plan_id = %self.plan_id(),
                    message = %join_error,
                    "dispatch call panicked"
                );
                let error = CoreError::transient(format!("dispatch call panicked: {join_error}"));
                (join_error.id(), Err(error))
            }
        };
        if let Some(dispatch) = self.dispatching.remove(&id) {
            self.settle_dispatch(dispatch, outcome);
        }
    }

    /// Takes over tasks that the stored state already shows as dispatched
    /// with a live handle, so they are not dispatched a second time.
    async fn adopt_stored_handles(&mut self) -> OrchestrationResult<()> {
        let plan_id = self.plan_id().clone();
        let stored = call_store(
            &self.context.store,
            self.context.config.persistence_retry,
            "load_plan",
            move |store| store.load_plan(&plan_id),
        )
        .await?;
        let Some(stored) = stored else {
            return Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("plan '{}' disappeared from the state store", self.plan_id()),
            )
            .for_plan(self.plan_id()));
        };
        if stored.version == self.state.version {
            return Ok(());
        }

        tracing::warn!(
            plan_id = %self.plan_id(),
            stored_version = stored.version,
            local_version = self.state.version,
            "stored plan state moved ahead of worker; adopting live handles"
        );
        for index in 0..self.state.plan.tasks.len() {
            let Some(stored_task) = stored.plan.tasks.get(index) else {
                continue;
            };
            let local = &self.state.plan.tasks[index];
            if local.status == TaskStatus::Ready
                && stored_task.id == local.id
                && stored_task.live_handle().is_some()
                && stored_task.attempt_count >= local.attempt_count
            {
                self.state.plan.tasks[index] = stored_task.clone();
                self.reuse_attempt.remove(&index);
                self.start_poller(index);
            }
        }
        self.state.version = stored.version;
        self.dirty = true;
        Ok(())
    }

    fn settle_dispatch(
        &mut self,
        dispatch: InFlightDispatch,
        outcome: AdapterResult<AdapterHandle>,
    ) {
        let InFlightDispatch {
            index,
            attempt,
            reused,
        } = dispatch;
        let key = IdempotencyKey::new(
            self.plan_id().clone(),
            self.state.plan.tasks[index].id.clone(),
            attempt,
        );
        if self.current_index(&key) != Some(index) {
            let Ok(handle) = outcome else {
                return;
            };
            self.context.backend.health.record_success();
            // A pushed result may have settled the attempt before the call returned.
            let delivered = self.state.plan.tasks[index]
                .handle
                .as_ref()
                .is_some_and(|stored| stored.attempt == attempt);
            if !delivered {
                tracing::debug!(
                    plan_id = %key.plan_id,
                    key = %key,
                    "dispatch returned for an abandoned attempt; cancelling it"
                );
                self.request_backend_cancel(index, handle);
            }
            return;
        }

        let cancelling = self.state.status() == PlanStatus::Cancelling;
        match outcome {
            Ok(handle) => {
                self.context.backend.health.record_success();
                self.state.plan.tasks[index].handle = Some(TaskHandle {
                    attempt,
                    handle: handle.clone(),
                });
                self.dirty = true;
                self.start_poller(index);
                if cancelling {
                    self.request_backend_cancel(index, handle);
                }
            }
            Err(error) if cancelling => {
                let key = self.key_for(index);
                self.ingested.insert(key);
                self.cancel_task(index, CancelReason::PlanCancelled, Some(error.message));
            }
            Err(error) if error.kind == CoreErrorKind::PermanentExecution => {
                tracing::warn!(
                    plan_id = %self.plan_id(),
                    task_id = %self.state.plan.tasks[index].id,
                    attempt,
                    message = %error.message,
                    "dispatch rejected permanently"
                );
                let event = self
                    .task_event(index, PlanEventKind::TaskDispatchFailed)
                    .attempt(attempt)
                    .error(error.message.clone());
                self.emit(event);
                let key = self.key_for(index);
                self.ingested.insert(key);
                self.fail(index, ExecutionError::permanent(error.message));
            }
            Err(error) => {
                let tripped = self.context.backend.health.record_failure();
                tracing::warn!(
                    plan_id = %self.plan_id(),
                    task_id = %self.state.plan.tasks[index].id,
                    attempt,
                    kind = ?error.kind,
                    message = %error.message,
                    tripped,
                    "dispatch failed; task returns to ready"
                );
                let event = self
                    .task_event(index, PlanEventKind::TaskDispatchFailed)
                    .attempt(attempt)
                    .error(error.message);
                self.emit(event);

                let hold_off = self.context.config.poll_interval;
                let task = &mut self.state.plan.tasks[index];
                if reused {
                    self.reuse_attempt.insert(index);
                } else {
                    task.attempt_count = task.attempt_count.saturating_sub(1);
                }
                task.status = TaskStatus::Ready;
                task.dispatched_at = None;
                task.handle = None;
                task.retry_at = Some(SystemTime::now() + hold_off);
            }
        }
    }

    fn start_poller(&mut self, index: usize) {
        let capabilities = self.context.backend.adapter.capabilities();
        if !capabilities.poll {
            return;
        }
        let Some(handle) = self.state.plan.tasks[index].live_handle().cloned() else {
            return;
        };

        let key = self.key_for(index);
        let adapter = self.context.backend.adapter.clone();
        let inbox = self.inbox_sender.clone();
        let interval = self.context.config.poll_interval;
        let poller = tokio::spawn(poll_until_ready(adapter, handle, key, inbox, interval));
        if let Some(previous) = self.pollers.insert(index, poller.abort_handle()) {
            previous.abort();
        }
    }

    fn stop_poller(&mut self, index: usize) {
        if let Some(poller) = self.pollers.remove(&index) {
            poller.abort();
        }
    }

    async fn handle_message(&mut self, message: WorkerMessage) -> OrchestrationResult<()> {
        match message {
            WorkerMessage::Result {
                key,
                handle,
                result,
            } => self.ingest(key, handle, result),
            WorkerMessage::HandleLost { key } => self.handle_lost(key),
            WorkerMessage::Cancel => self.begin_cancel(),
            WorkerMessage::Resolve {
                task_id,
                resolution,
                reply,
            } => {
                let outcome = self.resolve(&task_id, resolution).await;
                let _ = reply.send(outcome);
            }
        }
        Ok(())
    }

    fn current_index(&self, key: &IdempotencyKey) -> Option<usize> {
        if &key.plan_id != self.state.id() || self.ingested.contains(key) {
            return None;
        }
        let index = self.graph.index_of(&key.task_id)?;
        let task = &self.state.plan.tasks[index];
        (task.status == TaskStatus::Dispatched
            && !task.needs_intervention
            && task.attempt_count == key.attempt)
            .then_some(index)
    }

    fn ingest(&mut self, key: IdempotencyKey, handle: Option<AdapterHandle>, result: TaskResult) {
        let Some(index) = self.current_index(&key) else {
            tracing::debug!(
                plan_id = %key.plan_id,
                key = %key,
                "stale or duplicate result ignored"
            );
            return;
        };
        self.ingested.insert(key.clone());
        self.stop_poller(index);

        let cancelling = self.state.status() == PlanStatus::Cancelling;
        {
            let task = &mut self.state.plan.tasks[index];
            if task.handle.is_none()
                && let Some(handle) = handle
            {
                task.handle = Some(TaskHandle {
                    attempt: key.attempt,
                    handle,
                });
            }
        }
        self.dirty = true;

        match result.outcome {
            TaskOutcome::Succeeded => {
                let task = &mut self.state.plan.tasks[index];
                task.status = TaskStatus::Succeeded;
                task.result = Some(result);
                tracing::debug!(
                    plan_id = %key.plan_id,
                    task_id = %key.task_id,
                    attempt = key.attempt,
                    "task succeeded"
                );
                let event = self
                    .task_event(index, PlanEventKind::TaskSucceeded)
                    .attempt(key.attempt);
                self.emit(event);
            }
            TaskOutcome::Cancelled => {
                let reason = if cancelling {
                    CancelReason::PlanCancelled
                } else {
                    CancelReason::Backend
                };
                let task = &mut self.state.plan.tasks[index];
                task.status = TaskStatus::Cancelled;
                task.cancel_reason = Some(reason);
                task.result = Some(result);
                let event = self
                    .task_event(index, PlanEventKind::TaskCancelled)
                    .attempt(key.attempt);
                self.emit(event);
                if !cancelling {
                    block_dependents(&mut self.state, &self.graph, index, &mut self.pending_events);
                }
            }
            TaskOutcome::Failed => {
                let error = result.error.clone().unwrap_or_else(|| {
                    ExecutionError::permanent("backend reported a failure without details")
                });
                self.state.plan.tasks[index].result = Some(result);
                self.retry_or_fail(index, error);
            }
        }
    }

    fn retry_or_fail(&mut self, index: usize, error: ExecutionError) {
        let cancelling = self.state.status() == PlanStatus::Cancelling;
        let task = &self.state.plan.tasks[index];
        let attempts = task.budgeted_attempts();
        let retryable = error.class == ErrorClass::Transient
            && !cancelling
            && task.retry_policy.allows_another_attempt(attempts);

        if !retryable {
            self.fail(index, error);
            return;
        }

        let delay = task.retry_policy.jittered_delay(attempts, &mut self.rng);
        let attempt = task.attempt_count;
        let task = &mut self.state.plan.tasks[index];
        task.status = TaskStatus::Pending;
        task.dispatched_at = None;
        task.retry_at = Some(SystemTime::now() + delay);
        tracing::info!(
            plan_id = %self.state.plan.id,
            task_id = %self.state.plan.tasks[index].id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            message = %error.message,
            "transient failure; retry scheduled"
        );
        let event = self
            .task_event(index, PlanEventKind::TaskRetryScheduled)
            .attempt(attempt)
            .error(error.message);
        self.emit(event);
    }

    fn fail(&mut self, index: usize, error: ExecutionError) {
        self.stop_poller(index);
        tracing::warn!(
            plan_id = %self.state.plan.id,
            task_id = %self.state.plan.tasks[index].id,
            attempt = self.state.plan.tasks[index].attempt_count,
            message = %error.message,
            "task failed permanently"
        );
        fail_task(
            &mut self.state,
            &self.graph,
            index,
            error,
            self.context.config.failure_policy,
            &mut self.pending_events,
        );
        self.dirty = true;
    }

    fn handle_lost(&mut self, key: IdempotencyKey) {
        let Some(index) = self.current_index(&key) else {
            return;
        };
        tracing::warn!(plan_id = %key.plan_id, key = %key, "backend no longer knows the handle");
        self.apply_resume_fallback(index);
    }

    /// Classifies tasks persisted as dispatched by a previous worker.
    fn resume_in_flight(&mut self) {
        let plan_id = self.plan_id().clone();
        tracing::info!(plan_id = %plan_id, "resuming plan");
        self.emit(PlanEvent::plan(&plan_id, PlanEventKind::PlanResumed));

        let capabilities = self.context.backend.adapter.capabilities();
        let policy = self.context.config.resume_policy;
        for index in 0..self.state.plan.tasks.len() {
            let task = &self.state.plan.tasks[index];
            if task.status != TaskStatus::Dispatched || task.needs_intervention {
                continue;
            }
            let has_handle = task.live_handle().is_some();
            // Push-only backends are asked again through a same-key dispatch.
            if has_handle && policy.requery_handles && capabilities.requery && capabilities.poll {
                tracing::debug!(
                    plan_id = %plan_id,
                    task_id = %task.id,
                    "re-querying stored handle"
                );
                self.start_poller(index);
                continue;
            }
            self.apply_resume_fallback(index);
        }
    }

    fn apply_resume_fallback(&mut self, index: usize) {
        self.stop_poller(index);
        let attempt = self.state.plan.tasks[index].attempt_count;
        match self.context.config.resume_policy.fallback {
            ResumeFallback::Redispatch => {
                let task = &mut self.state.plan.tasks[index];
                task.status = TaskStatus::Ready;
                task.handle = None;
                task.dispatched_at = None;
                self.reuse_attempt.insert(index);
                let event = self
                    .task_event(index, PlanEventKind::TaskReady)
                    .attempt(attempt);
                self.emit(event);
            }
            ResumeFallback::ManualIntervention => {
                self.state.plan.tasks[index].needs_intervention = true;
                tracing::warn!(
                    plan_id = %self.plan_id(),
                    task_id = %self.state.plan.tasks[index].id,
                    attempt,
                    "task outcome unknown; awaiting manual intervention"
                );
                let event = self
                    .task_event(index, PlanEventKind::TaskAwaitingIntervention)
                    .attempt(attempt);
                self.emit(event);
            }
        }
    }

    fn begin_cancel(&mut self) {
        if self.state.is_terminal() || self.state.status() == PlanStatus::Cancelling {
            return;
        }
        let plan_id = self.plan_id().clone();
        tracing::info!(plan_id = %plan_id, "cancelling plan");
        self.state.plan.status = PlanStatus::Cancelling;
        self.emit(PlanEvent::plan(&plan_id, PlanEventKind::PlanCancelling));

        for index in 0..self.state.plan.tasks.len() {
            let task = &self.state.plan.tasks[index];
            let cancel_now = matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                || (task.status == TaskStatus::Dispatched && task.needs_intervention);
            if cancel_now {
                self.cancel_task(index, CancelReason::PlanCancelled, None);
                continue;
            }
            if task.status != TaskStatus::Dispatched {
                continue;
            }
            if let Some(handle) = task.live_handle().cloned() {
                self.request_backend_cancel(index, handle);
            }
        }

        self.cancel_deadline = Some(Instant::now() + self.context.config.cancellation_timeout);
    }

    fn cancel_task(&mut self, index: usize, reason: CancelReason, error: Option<String>) {
        self.stop_poller(index);
        let attempt = self.state.plan.tasks[index].attempt_count;
        let task = &mut self.state.plan.tasks[index];
        task.status = TaskStatus::Cancelled;
        task.cancel_reason = Some(reason);
        task.needs_intervention = false;
        task.retry_at = None;
        let mut event = self.task_event(index, PlanEventKind::TaskCancelled);
        if attempt > 0 {
            event = event.attempt(attempt);
        }
        if let Some(error) = error {
            event = event.error(error);
        }
        self.emit(event);
    }

    fn request_backend_cancel(&self, index: usize, handle: AdapterHandle) {
        let adapter = self.context.backend.adapter.clone();
        let plan_id = self.plan_id().clone();
        let task_id = self.state.plan.tasks[index].id.clone();
        tokio::spawn(async move {
            match adapter.cancel(handle).await {
                Ok(acknowledged) => {
                    tracing::debug!(
                        plan_id = %plan_id,
                        task_id = %task_id,
                        acknowledged,
                        "backend cancel requested"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        plan_id = %plan_id,
                        task_id = %task_id,
                        kind = ?error.kind,
                        message = %error.message,
                        "backend cancel failed"
                    );
                }
            }
        });
    }

    async fn resolve(
        &mut self,
        task_id: &TaskId,
        resolution: ManualResolution,
    ) -> OrchestrationResult<()> {
        let events = apply_resolution(
            &mut self.state,
            &self.graph,
            task_id,
            resolution,
            self.context.config.blocked_dependents,
            self.context.config.failure_policy,
        )?;
        if let Some(index) = self.graph.index_of(task_id) {
            self.stop_poller(index);
            self.reuse_attempt.remove(&index);
        }
        self.pending_events.extend(events);
        self.dirty = true;
        self.commit().await
    }

    fn handle_timers(&mut self) {
        let now = SystemTime::now();
        let expired: Vec<usize> = (0..self.state.plan.tasks.len())
            .filter(|&index| {
                let task = &self.state.plan.tasks[index];
                task.status == TaskStatus::Dispatched
                    && !task.needs_intervention
                    && match (task.timeout, task.dispatched_at) {
                        (Some(timeout), Some(dispatched_at)) => dispatched_at + timeout <= now,
                        _ => false,
                    }
            })
            .collect();

        for index in expired {
            let key = self.key_for(index);
            let timeout = self.state.plan.tasks[index].timeout.unwrap_or_default();
            self.stop_poller(index);
            self.ingested.insert(key.clone());
            if let Some(handle) = self.state.plan.tasks[index].live_handle().cloned() {
                self.request_backend_cancel(index, handle);
            }
            let message = format!(
                "attempt {} exceeded its timeout of {} ms",
                key.attempt,
                timeout.as_millis()
            );
            let event = self
                .task_event(index, PlanEventKind::TaskTimedOut)
                .attempt(key.attempt)
                .error(message.clone());
            self.emit(event);
            self.retry_or_fail(index, ExecutionError::transient(message));
        }

        if let Some(deadline) = self.cancel_deadline
            && Instant::now() >= deadline
        {
            self.cancel_deadline = None;
            for index in 0..self.state.plan.tasks.len() {
                if self.state.plan.tasks[index].status == TaskStatus::Dispatched {
                    let key = self.key_for(index);
                    self.ingested.insert(key);
                    self.cancel_task(
                        index,
                        CancelReason::CancellationTimeout,
                        Some("cancellation timeout elapsed".to_string()),
                    );
                }
            }
        }
    }

    fn next_wakeup(&self) -> Instant {
        let now = Instant::now();
        let wall_now = SystemTime::now();
        let at = |moment: SystemTime| now + moment.duration_since(wall_now).unwrap_or_default();

        let mut wakeup = now + IDLE_WAKEUP;
        for task in &self.state.plan.tasks {
            match task.status {
                TaskStatus::Pending | TaskStatus::Ready => {
                    // An elapsed backoff is handled by the next pass already.
                    if let Some(retry_at) = task.retry_at
                        && retry_at > wall_now
                    {
                        wakeup = wakeup.min(at(retry_at));
                    }
                }
                TaskStatus::Dispatched if !task.needs_intervention => {
                    if let (Some(timeout), Some(dispatched_at)) =
                        (task.timeout, task.dispatched_at)
                    {
                        wakeup = wakeup.min(at(dispatched_at + timeout));
                    }
                }
                _ => {}
            }
        }
        if let Some(deadline) = self.cancel_deadline {
            wakeup = wakeup.min(deadline);
        }
        if self.state.stalled {
            let resume_at = self
                .context
                .backend
                .health
                .unavailable_until()
                .unwrap_or(now + self.context.config.poll_interval);
            wakeup = wakeup.min(resume_at);
        }
        wakeup
    }

    fn try_finish(&mut self) {
        if self.state.is_terminal() || self.state.has_unfinished_tasks() {
            return;
        }
        let (status, kind) = if self.state.status() == PlanStatus::Cancelling {
            (PlanStatus::Cancelled, PlanEventKind::PlanCancelled)
        } else if self.state.all_succeeded() {
            (PlanStatus::Completed, PlanEventKind::PlanCompleted)
        } else {
            (PlanStatus::Failed, PlanEventKind::PlanFailed)
        };

        self.state.plan.status = status;
        self.state.stalled = false;
        self.cancel_deadline = None;
        let mut event = PlanEvent::plan(self.plan_id(), kind);
        if status == PlanStatus::Failed
            && let Some(failure) = &self.state.first_failure
        {
            event = event.error(format!(
                "task '{}' failed: {}",
                failure.task_id, failure.error.message
            ));
        }
        tracing::info!(plan_id = %self.plan_id(), status = ?status, "plan finished");
        self.emit(event);
    }

    /// Persists the state with a versioned write, then appends and publishes
    /// the events produced since the last commit.
    async fn commit(&mut self) -> OrchestrationResult<()> {
        if !self.dirty && self.pending_events.is_empty() {
            return Ok(());
        }
        self.state.updated_at = SystemTime::now();
        let snapshot = self.state.clone();
        let retry = self.context.config.persistence_retry;
        let plan_id = self.state.id().clone();
        let version = call_store(&self.context.store, retry, "save_plan", move |store| {
            store.save_plan(&snapshot)
        })
        .await
        .map_err(|error| error.for_plan(&plan_id))?;
        self.state.version = version;
        self.dirty = false;

        let events = std::mem::take(&mut self.pending_events);
        self.context
            .bus
            .record(&self.context.store, retry, events)
            .await?;
        self.snapshot.send_replace(self.state.clone());
        Ok(())
    }
}

async fn poll_until_ready(
    adapter: Arc<dyn ExecutionAdapter>,
    handle: AdapterHandle,
    key: IdempotencyKey,
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        match adapter.poll(handle.clone()).await {
            Ok(PollOutcome::Pending) => {}
            Ok(PollOutcome::Ready(result)) => {
                let _ = inbox.send(WorkerMessage::Result {
                    key,
                    handle: Some(handle),
                    result,
                });
                return;
            }
            Err(error) if error.kind == CoreErrorKind::NotFound => {
                let _ = inbox.send(WorkerMessage::HandleLost { key });
                return;
            }
            Err(error) => {
                tracing::warn!(
                    key = %key,
                    kind = ?error.kind,
                    message = %error.message,
                    "poll failed; will retry"
                );
            }
        }
        if inbox.is_closed() {
            return;
        }
    }
}

fn task_payload(state: &PlanState, index: usize) -> Value {
    state.plan.tasks[index].payload.clone()
}

/// Marks a task permanently failed, records the plan's first failure and
/// applies the cascade: dependents become blocked and, under fail-fast,
/// every task that has not started is cancelled.
pub(crate) fn fail_task(
    state: &mut PlanState,
    graph: &DependencyGraph,
    index: usize,
    error: ExecutionError,
    failure_policy: FailurePolicy,
    events: &mut Vec<PlanEvent>,
) {
    let plan_id = state.plan.id.clone();
    let now = SystemTime::now();
    let task = &mut state.plan.tasks[index];
    task.status = TaskStatus::Failed;
    task.needs_intervention = false;
    task.retry_at = None;
    let attempt = task.attempt_count;
    let task_id = task.id.clone();

    let mut event = PlanEvent::task(&plan_id, &task_id, PlanEventKind::TaskFailed)
        .error(error.message.clone());
    if attempt > 0 {
        event = event.attempt(attempt);
    }
    events.push(event);

    if state.first_failure.is_none() {
        state.first_failure = Some(FailureSummary {
            task_id,
            attempt,
            error,
            failed_at: now,
        });
    }

    block_dependents(state, graph, index, events);

    if failure_policy == FailurePolicy::FailFast && state.plan.status != PlanStatus::Cancelling {
        for other in 0..state.plan.tasks.len() {
            let task = &mut state.plan.tasks[other];
            let halted = matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                || (task.status == TaskStatus::Dispatched && task.needs_intervention);
            if halted {
                task.status = TaskStatus::Cancelled;
                task.cancel_reason = Some(CancelReason::PlanFailed);
                task.needs_intervention = false;
                task.retry_at = None;
                events.push(PlanEvent::task(&plan_id, &task.id, PlanEventKind::TaskCancelled));
            }
        }
    }
}

pub(crate) fn block_dependents(
    state: &mut PlanState,
    graph: &DependencyGraph,
    index: usize,
    events: &mut Vec<PlanEvent>,
) {
    let plan_id = state.plan.id.clone();
    for dependent in graph.transitive_dependents(index) {
        let task = &mut state.plan.tasks[dependent];
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
            task.status = TaskStatus::Blocked;
            task.retry_at = None;
            events.push(PlanEvent::task(&plan_id, &task.id, PlanEventKind::TaskBlocked));
        }
    }
}
