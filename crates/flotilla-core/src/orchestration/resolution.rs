use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    CancelReason, CoreError, CoreErrorKind, ExecutionError, FailureSummary, PlanEvent,
    PlanEventKind, PlanId, PlanState, PlanStatus, TaskId, TaskResult, TaskStatus,
};
use crate::orchestration::scheduler::fail_task;
use crate::orchestration::{
    BlockedDependentsPolicy, DependencyGraph, FailurePolicy, OrchestrationResult,
};

/// Operator decision for a failed task or one whose outcome is unknown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualResolution {
    /// Record the task as succeeded with the given output.
    MarkSucceeded { output: Value },
    /// Run the task again with a fresh retry budget.
    Retry,
    /// Only for tasks awaiting intervention.
    MarkFailed { reason: String },
}

pub(crate) fn apply_resolution(
    state: &mut PlanState,
    graph: &DependencyGraph,
    task_id: &TaskId,
    resolution: ManualResolution,
    policy: BlockedDependentsPolicy,
    failure_policy: FailurePolicy,
) -> OrchestrationResult<Vec<PlanEvent>> {
    let plan_id = state.id().clone();
    let index = graph.index_of(task_id).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::NotFound,
            format!("plan '{plan_id}' has no task '{task_id}'"),
        )
        .for_plan(&plan_id)
        .for_task(task_id)
    })?;

    if matches!(
        state.status(),
        PlanStatus::Cancelling | PlanStatus::Cancelled
    ) {
        return Err(invalid(&plan_id, task_id, "plan was cancelled"));
    }

    let task = &state.plan.tasks[index];
    let awaiting = task.status == TaskStatus::Dispatched && task.needs_intervention;
    let failed = task.status == TaskStatus::Failed;
    if !awaiting && !failed {
        return Err(invalid(
            &plan_id,
            task_id,
            &format!(
                "task is {}; only failed tasks or tasks awaiting intervention can be resolved",
                task.status.as_str()
            ),
        ));
    }
    if failed && policy == BlockedDependentsPolicy::RequireResubmission {
        return Err(invalid(
            &plan_id,
            task_id,
            "manual resolution of failed tasks is disabled; resubmit the plan",
        ));
    }

    let mut events = Vec::new();
    let attempt = task.attempt_count;
    let mut resolved = PlanEvent::task(&plan_id, task_id, PlanEventKind::TaskResolved);
    if attempt > 0 {
        resolved = resolved.attempt(attempt);
    }

    match resolution {
        ManualResolution::MarkFailed { reason } => {
            if failed {
                return Err(invalid(&plan_id, task_id, "task has already failed"));
            }
            events.push(resolved.error(reason.clone()));
            fail_task(
                state,
                graph,
                index,
                ExecutionError::permanent(reason),
                failure_policy,
                &mut events,
            );
            return Ok(events);
        }
        ManualResolution::MarkSucceeded { output } => {
            let task = &mut state.plan.tasks[index];
            task.status = TaskStatus::Succeeded;
            task.needs_intervention = false;
            task.retry_at = None;
            task.result = Some(TaskResult::succeeded(
                task_id.clone(),
                attempt,
                output,
                SystemTime::now(),
            ));
        }
        ManualResolution::Retry => {
            let task = &mut state.plan.tasks[index];
            task.status = TaskStatus::Pending;
            task.needs_intervention = false;
            task.attempt_floor = task.attempt_count;
            task.retry_at = None;
            task.handle = None;
            task.result = None;
            task.dispatched_at = None;
        }
    }
    events.push(resolved);

    reopen_halted_tasks(state, graph, &mut events);

    if state
        .first_failure
        .as_ref()
        .is_some_and(|failure| &failure.task_id == task_id)
    {
        state.first_failure = earliest_remaining_failure(state);
    }

    if state.status() == PlanStatus::Failed {
        state.plan.status = PlanStatus::Running;
        events.push(PlanEvent::plan(&plan_id, PlanEventKind::PlanResumed));
    }

    Ok(events)
}

/// Tasks cancelled by fail-fast go back to pending; blocked tasks whose
/// ancestors are all healthy again are unblocked.
fn reopen_halted_tasks(
    state: &mut PlanState,
    graph: &DependencyGraph,
    events: &mut Vec<PlanEvent>,
) {
    let plan_id = state.id().clone();
    let mut reopened = vec![false; state.plan.tasks.len()];
    for (index, task) in state.plan.tasks.iter_mut().enumerate() {
        if task.status == TaskStatus::Cancelled
            && task.cancel_reason == Some(CancelReason::PlanFailed)
        {
            task.status = TaskStatus::Pending;
            task.cancel_reason = None;
            reopened[index] = true;
        }
    }

    for index in 0..state.plan.tasks.len() {
        let status = state.plan.tasks[index].status;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
            continue;
        }
        let unresolved = graph.has_unresolved_ancestor(&state.plan.tasks, index);
        let task = &mut state.plan.tasks[index];
        if unresolved {
            if task.status != TaskStatus::Blocked {
                task.status = TaskStatus::Blocked;
                events.push(PlanEvent::task(&plan_id, &task.id, PlanEventKind::TaskBlocked));
            }
        } else if task.status == TaskStatus::Blocked || reopened[index] {
            task.status = TaskStatus::Pending;
            events.push(PlanEvent::task(&plan_id, &task.id, PlanEventKind::TaskReopened));
        }
    }
}

fn earliest_remaining_failure(state: &PlanState) -> Option<FailureSummary> {
    state
        .plan
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .filter_map(|task| {
            let result = task.result.as_ref()?;
            Some(FailureSummary {
                task_id: task.id.clone(),
                attempt: task.attempt_count,
                error: result
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionError::permanent("task failed")),
                failed_at: result.finished_at,
            })
        })
        .min_by_key(|summary| summary.failed_at)
}

fn invalid(plan_id: &PlanId, task_id: &TaskId, message: &str) -> CoreError {
    CoreError::new(
        CoreErrorKind::InvalidInput,
        format!("cannot resolve task '{task_id}': {message}"),
    )
    .for_plan(plan_id)
    .for_task(task_id)
}
