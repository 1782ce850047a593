pub mod descriptor;
pub mod error;
pub mod event;
pub mod ids;
pub mod plan;
pub mod retry;
pub mod task;

pub use descriptor::{PlanDescriptor, TaskDescriptor};
pub use error::{CoreError, CoreErrorKind};
pub use event::{EventCursor, PlanEvent, PlanEventKind};
pub use ids::{IdempotencyKey, PlanId, TaskId};
pub use plan::{FailureSummary, Plan, PlanReport, PlanState, PlanStatus};
pub use retry::RetryPolicy;
pub use task::{
    AdapterHandle, CancelReason, ErrorClass, ExecutionError, Task, TaskHandle, TaskOutcome,
    TaskResult, TaskStatus,
};
