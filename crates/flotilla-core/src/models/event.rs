use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::{PlanId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEventKind {
    PlanSubmitted,
    PlanStarted,
    PlanResumed,
    PlanStalled,
    PlanUnstalled,
    PlanCancelling,
    PlanCompleted,
    PlanFailed,
    PlanCancelled,
    TaskReady,
    TaskDispatched,
    TaskDispatchFailed,
    TaskSucceeded,
    TaskRetryScheduled,
    TaskTimedOut,
    TaskFailed,
    TaskBlocked,
    TaskCancelled,
    TaskAwaitingIntervention,
    TaskResolved,
    TaskReopened,
}

impl PlanEventKind {
    pub fn is_plan_terminal(self) -> bool {
        matches!(
            self,
            PlanEventKind::PlanCompleted | PlanEventKind::PlanFailed | PlanEventKind::PlanCancelled
        )
    }
}

/// One lifecycle event of a plan. `sequence` is assigned by the state store
/// when the event is appended to the plan's trace and doubles as the stream
/// cursor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    pub sequence: u64,
    pub plan_id: PlanId,
    pub task_id: Option<TaskId>,
    pub kind: PlanEventKind,
    pub timestamp: SystemTime,
    pub attempt: Option<u32>,
    pub error: Option<String>,
}

impl PlanEvent {
    pub fn plan(plan_id: &PlanId, kind: PlanEventKind) -> Self {
        Self {
            sequence: 0,
            plan_id: plan_id.clone(),
            task_id: None,
            kind,
            timestamp: SystemTime::now(),
            attempt: None,
            error: None,
        }
    }

    pub fn task(plan_id: &PlanId, task_id: &TaskId, kind: PlanEventKind) -> Self {
        Self {
            task_id: Some(task_id.clone()),
            ..Self::plan(plan_id, kind)
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Position in a plan's persisted trace; events with a greater sequence are
/// delivered after reconnecting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EventCursor(pub u64);
