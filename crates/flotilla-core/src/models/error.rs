use crate::models::{PlanId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    Validation,
    TransientExecution,
    PermanentExecution,
    AdapterUnavailable,
    StorageFailure,
    Conflict,
    NotFound,
    InvalidInput,
    Timeout,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub plan: Option<PlanId>,
    pub task: Option<TaskId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            plan: None,
            task: None,
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::TransientExecution, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::PermanentExecution, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::AdapterUnavailable, message)
    }

    pub fn for_plan(mut self, plan: &PlanId) -> Self {
        self.plan.get_or_insert_with(|| plan.clone());
        self
    }

    pub fn for_task(mut self, task: &TaskId) -> Self {
        self.task.get_or_insert_with(|| task.clone());
        self
    }

    /// Storage errors are the only kind retried by the persistence layer;
    /// version conflicts are never retried.
    pub fn is_retryable_storage(&self) -> bool {
        self.kind == CoreErrorKind::StorageFailure
    }
}
