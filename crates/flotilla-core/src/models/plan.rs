use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ExecutionError, PlanId, Task, TaskId, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Created,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PlanStatus::Created => "created",
            PlanStatus::Running => "running",
            PlanStatus::Cancelling => "cancelling",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(PlanStatus::Created),
            "running" => Some(PlanStatus::Running),
            "cancelling" => Some(PlanStatus::Cancelling),
            "completed" => Some(PlanStatus::Completed),
            "failed" => Some(PlanStatus::Failed),
            "cancelled" => Some(PlanStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub tasks: Vec<Task>,
    pub metadata: BTreeMap<String, Value>,
    pub created_at: SystemTime,
    pub status: PlanStatus,
    pub backend: String,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Plan {
    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == task_id)
    }
}

/// First permanently failing task of a plan, kept for diagnostics.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub task_id: TaskId,
    pub attempt: u32,
    pub error: ExecutionError,
    pub failed_at: SystemTime,
}

/// Persisted snapshot of a plan and every task's lifecycle state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanState {
    pub plan: Plan,
    pub version: u64,
    #[serde(default)]
    pub stalled: bool,
    #[serde(default)]
    pub first_failure: Option<FailureSummary>,
    pub updated_at: SystemTime,
}

impl PlanState {
    pub fn new(plan: Plan) -> Self {
        let updated_at = plan.created_at;
        Self {
            plan,
            version: 0,
            stalled: false,
            first_failure: None,
            updated_at,
        }
    }

    pub fn id(&self) -> &PlanId {
        &self.plan.id
    }

    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }

    pub fn is_terminal(&self) -> bool {
        self.plan.status.is_terminal()
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.plan.task(task_id)
    }

    pub fn has_unfinished_tasks(&self) -> bool {
        self.plan.tasks.iter().any(|task| {
            matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Dispatched
            )
        })
    }

    pub fn all_succeeded(&self) -> bool {
        self.plan
            .tasks
            .iter()
            .all(|task| task.status == TaskStatus::Succeeded)
    }
}

/// Aggregate view of a plan: outputs of succeeded tasks and failure details.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanReport {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    pub stalled: bool,
    pub task_counts: BTreeMap<&'static str, usize>,
    pub outputs: BTreeMap<TaskId, Value>,
    pub first_failure: Option<FailureSummary>,
}

impl PlanReport {
    pub fn from_state(state: &PlanState) -> Self {
        let mut task_counts = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for task in &state.plan.tasks {
            *task_counts.entry(task.status.as_str()).or_insert(0) += 1;
            if task.status == TaskStatus::Succeeded
                && let Some(result) = &task.result
            {
                outputs.insert(task.id.clone(), result.output.clone());
            }
        }

        Self {
            plan_id: state.plan.id.clone(),
            status: state.plan.status,
            stalled: state.stalled,
            task_counts,
            outputs,
            first_failure: state.first_failure.clone(),
        }
    }
}
