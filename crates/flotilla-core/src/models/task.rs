use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::retry::option_millis;
use crate::models::{RetryPolicy, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Dispatched,
    Succeeded,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub class: ErrorClass,
    pub message: String,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

/// Outcome of one attempt as reported by the execution backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub attempt: u32,
    pub outcome: TaskOutcome,
    pub output: Value,
    pub error: Option<ExecutionError>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl TaskResult {
    pub fn succeeded(task_id: TaskId, attempt: u32, output: Value, started_at: SystemTime) -> Self {
        Self {
            task_id,
            attempt,
            outcome: TaskOutcome::Succeeded,
            output,
            error: None,
            started_at,
            finished_at: SystemTime::now(),
        }
    }

    pub fn failed(
        task_id: TaskId,
        attempt: u32,
        error: ExecutionError,
        started_at: SystemTime,
    ) -> Self {
        Self {
            task_id,
            attempt,
            outcome: TaskOutcome::Failed,
            output: Value::Null,
            error: Some(error),
            started_at,
            finished_at: SystemTime::now(),
        }
    }

    pub fn cancelled(task_id: TaskId, attempt: u32, started_at: SystemTime) -> Self {
        Self {
            task_id,
            attempt,
            outcome: TaskOutcome::Cancelled,
            output: Value::Null,
            error: None,
            started_at,
            finished_at: SystemTime::now(),
        }
    }
}

/// Opaque handle returned by an execution backend for one dispatched attempt.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterHandle(pub String);

impl AdapterHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub attempt: u32,
    pub handle: AdapterHandle,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    PlanCancelled,
    PlanFailed,
    Backend,
    CancellationTimeout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: Value,
    pub depends_on: Vec<TaskId>,
    pub retry_policy: RetryPolicy,
    #[serde(default, rename = "timeout_ms", with = "option_millis")]
    pub timeout: Option<Duration>,
    pub status: TaskStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub attempt_floor: u32,
    pub handle: Option<TaskHandle>,
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub retry_at: Option<SystemTime>,
    #[serde(default)]
    pub dispatched_at: Option<SystemTime>,
    #[serde(default)]
    pub needs_intervention: bool,
    #[serde(default)]
    pub cancel_reason: Option<CancelReason>,
}

impl Task {
    pub fn new(
        id: TaskId,
        payload: Value,
        depends_on: Vec<TaskId>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            payload,
            depends_on,
            retry_policy,
            timeout: None,
            status: TaskStatus::Pending,
            attempt_count: 0,
            attempt_floor: 0,
            handle: None,
            result: None,
            retry_at: None,
            dispatched_at: None,
            needs_intervention: false,
            cancel_reason: None,
        }
    }

    /// Attempts counted against the retry budget.
    pub fn budgeted_attempts(&self) -> u32 {
        self.attempt_count.saturating_sub(self.attempt_floor)
    }

    /// The handle of the current attempt, if the backend acknowledged it.
    pub fn live_handle(&self) -> Option<&AdapterHandle> {
        if self.status != TaskStatus::Dispatched {
            return None;
        }
        self.handle
            .as_ref()
            .filter(|handle| handle.attempt == self.attempt_count)
            .map(|handle| &handle.handle)
    }

    pub fn is_backing_off(&self, now: SystemTime) -> bool {
        self.retry_at.is_some_and(|retry_at| retry_at > now)
    }
}
