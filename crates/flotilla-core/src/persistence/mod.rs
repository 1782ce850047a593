pub mod in_memory;

pub use in_memory::InMemoryStateStore;

use crate::models::{CoreError, EventCursor, PlanEvent, PlanId, PlanState};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Durable plan state and per-plan event trace. Implementations are blocking;
/// async callers go through `spawn_blocking`.
pub trait StateStore: Send + Sync {
    /// Stores a new plan at version 1. Fails with `Conflict` when the id is
    /// already taken.
    fn create_plan(&self, state: &PlanState) -> PersistenceResult<u64>;

    /// Replaces the stored state if its version still equals
    /// `state.version`; returns the new version. A mismatch is a `Conflict`.
    fn save_plan(&self, state: &PlanState) -> PersistenceResult<u64>;

    fn load_plan(&self, plan_id: &PlanId) -> PersistenceResult<Option<PlanState>>;

    /// Ids of plans that have not reached a terminal status.
    fn list_active_plans(&self) -> PersistenceResult<Vec<PlanId>>;

    /// Appends to the plan's trace and returns the assigned sequence, starting
    /// at 1 for each plan.
    fn append_trace(&self, event: &PlanEvent) -> PersistenceResult<u64>;

    fn read_trace(
        &self,
        plan_id: &PlanId,
        after: EventCursor,
        limit: usize,
    ) -> PersistenceResult<Vec<PlanEvent>>;
}
