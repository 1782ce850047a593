use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::{CoreError, CoreErrorKind, EventCursor, PlanEvent, PlanId, PlanState};
use crate::persistence::{PersistenceResult, StateStore};

/// Process-local state store. Used by tests and by embedders that do not need
/// durability across restarts.
#[derive(Default)]
pub struct InMemoryStateStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    plans: HashMap<PlanId, PlanState>,
    traces: HashMap<PlanId, Vec<PlanEvent>>,
    injected_write_failures: u32,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a storage error.
    pub fn inject_write_failures(&self, count: u32) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.injected_write_failures = count;
        Ok(())
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            CoreError::new(CoreErrorKind::Internal, "state store mutex poisoned")
        })
    }
}

impl StoreState {
    fn take_injected_failure(&mut self, operation: &str) -> PersistenceResult<()> {
        if self.injected_write_failures == 0 {
            return Ok(());
        }
        self.injected_write_failures -= 1;
        Err(CoreError::new(
            CoreErrorKind::StorageFailure,
            format!("in-memory store '{operation}' failed: injected failure"),
        ))
    }
}

impl StateStore for InMemoryStateStore {
    fn create_plan(&self, plan_state: &PlanState) -> PersistenceResult<u64> {
        let mut state = self.lock_state()?;
        state.take_injected_failure("create_plan")?;
        let plan_id = plan_state.id().clone();
        if state.plans.contains_key(&plan_id) {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("plan '{plan_id}' already exists"),
            )
            .for_plan(&plan_id));
        }

        let mut stored = plan_state.clone();
        stored.version = 1;
        state.plans.insert(plan_id.clone(), stored);
        state.traces.entry(plan_id).or_default();
        Ok(1)
    }

    fn save_plan(&self, plan_state: &PlanState) -> PersistenceResult<u64> {
        let mut state = self.lock_state()?;
        state.take_injected_failure("save_plan")?;
        let plan_id = plan_state.id();
        let Some(stored) = state.plans.get_mut(plan_id) else {
            return Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("plan '{plan_id}' does not exist"),
            )
            .for_plan(plan_id));
        };
        if stored.version != plan_state.version {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!(
                    "plan '{plan_id}' version mismatch: stored {}, expected {}",
                    stored.version, plan_state.version
                ),
            )
            .for_plan(plan_id));
        }

        let next_version = plan_state.version.saturating_add(1);
        let mut updated = plan_state.clone();
        updated.version = next_version;
        *stored = updated;
        Ok(next_version)
    }

    fn load_plan(&self, plan_id: &PlanId) -> PersistenceResult<Option<PlanState>> {
        let state = self.lock_state()?;
        Ok(state.plans.get(plan_id).cloned())
    }

    fn list_active_plans(&self) -> PersistenceResult<Vec<PlanId>> {
        let state = self.lock_state()?;
        let mut active: Vec<PlanId> = state
            .plans
            .values()
            .filter(|plan| !plan.is_terminal())
            .map(|plan| plan.id().clone())
            .collect();
        active.sort();
        Ok(active)
    }

    fn append_trace(&self, event: &PlanEvent) -> PersistenceResult<u64> {
        let mut state = self.lock_state()?;
        state.take_injected_failure("append_trace")?;
        let trace = state.traces.entry(event.plan_id.clone()).or_default();
        let sequence = trace.len() as u64 + 1;
        let mut stored = event.clone();
        stored.sequence = sequence;
        trace.push(stored);
        Ok(sequence)
    }

    fn read_trace(
        &self,
        plan_id: &PlanId,
        after: EventCursor,
        limit: usize,
    ) -> PersistenceResult<Vec<PlanEvent>> {
        let state = self.lock_state()?;
        Ok(state
            .traces
            .get(plan_id)
            .map(|trace| {
                trace
                    .iter()
                    .filter(|event| event.sequence > after.0)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
