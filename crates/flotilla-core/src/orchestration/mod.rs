pub mod events;
pub mod orchestrator;
pub mod resolution;
pub mod resolver;
pub mod scheduler;
pub(crate) mod store_calls;

pub use events::{EventBus, MetricsSnapshot, OrchestratorMetrics, PlanEventStream};
pub use orchestrator::Orchestrator;
pub use resolution::ManualResolution;
pub use resolver::DependencyGraph;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::HealthPolicy;
use crate::models::retry::millis;
use crate::models::{CoreError, RetryPolicy};

pub type OrchestrationResult<T> = Result<T, CoreError>;

/// What happens to the rest of a plan once a task fails permanently.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every task that has not started; in-flight tasks finish.
    #[default]
    FailFast,
    /// Keep running branches that do not depend on the failed task.
    ContinueIndependent,
}

/// Whether a failed task may be resolved by an operator after the fact.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedDependentsPolicy {
    #[default]
    RequireResubmission,
    AllowManualResolution,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeFallback {
    #[default]
    Redispatch,
    ManualIntervention,
}

/// Treatment of tasks found `dispatched` without a result when a plan is
/// resumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumePolicy {
    pub requery_handles: bool,
    pub fallback: ResumeFallback,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            requery_handles: true,
            fallback: ResumeFallback::Redispatch,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceRetry {
    pub max_attempts: u32,
    #[serde(rename = "delay_ms", with = "millis")]
    pub delay: Duration,
}

impl Default for PersistenceRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "cancellation_timeout_ms", with = "millis")]
    pub cancellation_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub blocked_dependents: BlockedDependentsPolicy,
    pub resume_policy: ResumePolicy,
    pub health: HealthPolicy,
    pub persistence_retry: PersistenceRetry,
    pub default_backend: Option<String>,
    pub default_retry_policy: RetryPolicy,
    pub event_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            poll_interval: Duration::from_millis(250),
            cancellation_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::default(),
            blocked_dependents: BlockedDependentsPolicy::default(),
            resume_policy: ResumePolicy::default(),
            health: HealthPolicy::default(),
            persistence_retry: PersistenceRetry::default(),
            default_backend: None,
            default_retry_policy: RetryPolicy::default(),
            event_buffer: 1024,
        }
    }
}

impl OrchestratorConfig {
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn cancellation_timeout(mut self, cancellation_timeout: Duration) -> Self {
        self.cancellation_timeout = cancellation_timeout;
        self
    }

    pub fn failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn blocked_dependents(mut self, blocked_dependents: BlockedDependentsPolicy) -> Self {
        self.blocked_dependents = blocked_dependents;
        self
    }

    pub fn resume_policy(mut self, resume_policy: ResumePolicy) -> Self {
        self.resume_policy = resume_policy;
        self
    }

    pub fn health(mut self, health: HealthPolicy) -> Self {
        self.health = health;
        self
    }

    pub fn persistence_retry(mut self, persistence_retry: PersistenceRetry) -> Self {
        self.persistence_retry = persistence_retry;
        self
    }

    pub fn default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    pub fn default_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.default_retry_policy = retry_policy;
        self
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.max_concurrency == 0 {
            return Err(CoreError::new(
                crate::models::CoreErrorKind::InvalidInput,
                "max_concurrency must be greater than zero",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(CoreError::new(
                crate::models::CoreErrorKind::InvalidInput,
                "poll_interval must be greater than zero",
            ));
        }
        self.default_retry_policy.validate()
    }
}
