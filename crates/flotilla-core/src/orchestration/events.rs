use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, timeout_at};

use crate::models::{CoreError, CoreErrorKind, EventCursor, PlanEvent, PlanEventKind, PlanId};
use crate::orchestration::store_calls::call_store;
use crate::orchestration::{OrchestrationResult, PersistenceRetry};
use crate::persistence::StateStore;

const TRACE_PAGE: usize = 256;

#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    plans_submitted: AtomicU64,
    plans_completed: AtomicU64,
    plans_failed: AtomicU64,
    plans_cancelled: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub plans_submitted: u64,
    pub plans_completed: u64,
    pub plans_failed: u64,
    pub plans_cancelled: u64,
    pub tasks_dispatched: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
}

impl OrchestratorMetrics {
    fn record(&self, kind: PlanEventKind) {
        let counter = match kind {
            PlanEventKind::PlanSubmitted => &self.plans_submitted,
            PlanEventKind::PlanCompleted => &self.plans_completed,
            PlanEventKind::PlanFailed => &self.plans_failed,
            PlanEventKind::PlanCancelled => &self.plans_cancelled,
            PlanEventKind::TaskDispatched => &self.tasks_dispatched,
            PlanEventKind::TaskRetryScheduled => &self.tasks_retried,
            PlanEventKind::TaskFailed => &self.tasks_failed,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            plans_submitted: self.plans_submitted.load(Ordering::Relaxed),
            plans_completed: self.plans_completed.load(Ordering::Relaxed),
            plans_failed: self.plans_failed.load(Ordering::Relaxed),
            plans_cancelled: self.plans_cancelled.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out of persisted plan events to live subscribers. Counters are
/// updated from the same path so they never disagree with the trace.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<PlanEvent>,
    metrics: Arc<OrchestratorMetrics>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            metrics: Arc::new(OrchestratorMetrics::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.sender.subscribe()
    }

    pub fn metrics(&self) -> &OrchestratorMetrics {
        &self.metrics
    }

    pub(crate) fn publish(&self, event: PlanEvent) {
        self.metrics.record(event.kind);
        // No subscribers is not an error; the trace remains the record.
        let _ = self.sender.send(event);
    }

    /// Appends events to the plan's trace in order, then publishes each one
    /// with its assigned sequence.
    pub(crate) async fn record(
        &self,
        store: &Arc<dyn StateStore>,
        retry: PersistenceRetry,
        events: Vec<PlanEvent>,
    ) -> OrchestrationResult<()> {
        for mut event in events {
            let to_append = event.clone();
            event.sequence = call_store(store, retry, "append_trace", move |store| {
                store.append_trace(&to_append)
            })
            .await?;
            self.publish(event);
        }
        Ok(())
    }
}

/// Finite, resumable stream of one plan's events. Events are always read
/// from the persisted trace, so reconnecting with the last seen cursor
/// yields every later event exactly once. The broadcast bus only wakes the
/// reader up.
pub struct PlanEventStream {
    plan_id: PlanId,
    store: Arc<dyn StateStore>,
    retry: PersistenceRetry,
    receiver: broadcast::Receiver<PlanEvent>,
    cursor: EventCursor,
    buffer: VecDeque<PlanEvent>,
    refresh_interval: Duration,
    terminal_seen: bool,
    finished: bool,
}

impl PlanEventStream {
    pub(crate) fn new(
        plan_id: PlanId,
        store: Arc<dyn StateStore>,
        retry: PersistenceRetry,
        receiver: broadcast::Receiver<PlanEvent>,
        cursor: EventCursor,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            plan_id,
            store,
            retry,
            receiver,
            cursor,
            buffer: VecDeque::new(),
            refresh_interval,
            terminal_seen: false,
            finished: false,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// Sequence of the last delivered event; pass it back to
    /// `stream_plan_events` to continue after a disconnect.
    pub fn cursor(&self) -> EventCursor {
        self.cursor
    }

    /// Next event, or `None` once the plan's terminal event was delivered.
    pub async fn next(&mut self) -> Option<OrchestrationResult<PlanEvent>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                self.cursor = EventCursor(event.sequence);
                if event.kind.is_plan_terminal() {
                    self.finished = true;
                    self.buffer.clear();
                }
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            match self.read_page().await {
                Ok(events) if !events.is_empty() => {
                    self.buffer.extend(events);
                    continue;
                }
                Ok(_) => {}
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }

            match self.plan_is_terminal().await {
                Ok(true) if self.terminal_seen => {
                    // The trace ends without the terminal event, e.g. after a
                    // crash between saving the state and appending.
                    self.finished = true;
                    return None;
                }
                Ok(true) => {
                    // The state is saved before its events are appended.
                    self.terminal_seen = true;
                }
                Ok(false) => {}
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }

            self.wait_for_activity().await;
        }
    }

    /// Drains the stream into a vector.
    pub async fn collect_all(mut self) -> OrchestrationResult<Vec<PlanEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    async fn read_page(&self) -> OrchestrationResult<Vec<PlanEvent>> {
        let plan_id = self.plan_id.clone();
        let after = self.cursor;
        call_store(&self.store, self.retry, "read_trace", move |store| {
            store.read_trace(&plan_id, after, TRACE_PAGE)
        })
        .await
    }

    async fn plan_is_terminal(&self) -> OrchestrationResult<bool> {
        let plan_id = self.plan_id.clone();
        let state = call_store(&self.store, self.retry, "load_plan", move |store| {
            store.load_plan(&plan_id)
        })
        .await?;
        match state {
            Some(state) => Ok(state.is_terminal()),
            None => Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("plan '{}' does not exist", self.plan_id),
            )
            .for_plan(&self.plan_id)),
        }
    }

    async fn wait_for_activity(&mut self) {
        let deadline = Instant::now() + self.refresh_interval;
        loop {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Ok(event)) if event.plan_id == self.plan_id => return,
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(_))) => return,
                Ok(Err(RecvError::Closed)) => {
                    tokio::time::sleep_until(deadline).await;
                    return;
                }
                Err(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventBus;
    use crate::models::{PlanEvent, PlanEventKind, PlanId};

    #[test]
    fn publish_updates_counters() {
        let bus = EventBus::new(8);
        let plan = PlanId::from("p");
        bus.publish(PlanEvent::plan(&plan, PlanEventKind::PlanSubmitted));
        bus.publish(PlanEvent::plan(&plan, PlanEventKind::PlanStarted));
        bus.publish(PlanEvent::plan(&plan, PlanEventKind::PlanCompleted));

        let snapshot = bus.metrics().snapshot();
        assert_eq!(snapshot.plans_submitted, 1);
        assert_eq!(snapshot.plans_completed, 1);
        assert_eq!(snapshot.tasks_dispatched, 0);
    }
}
