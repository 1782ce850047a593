use std::collections::{BTreeMap, HashSet};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CoreError, Plan, PlanId, PlanStatus, RetryPolicy, Task, TaskId};

/// Submission format of a plan, readable from JSON or YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    pub id: PlanId,
    pub name: String,
    pub tasks: Vec<TaskDescriptor>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PlanDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PlanId::new(id),
            name: name.into(),
            tasks: Vec::new(),
            metadata: BTreeMap::new(),
            backend: None,
            max_concurrency: None,
        }
    }

    pub fn task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw)
            .map_err(|error| CoreError::validation(format!("malformed plan descriptor: {error}")))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(raw)
            .map_err(|error| CoreError::validation(format!("malformed plan descriptor: {error}")))
    }

    /// Builds the initial plan. Graph-level checks (references, cycles) are
    /// the resolver's job; this only validates per-field constraints.
    pub fn into_plan(
        self,
        backend: String,
        default_retry: &RetryPolicy,
    ) -> Result<Plan, CoreError> {
        if self.id.as_str().trim().is_empty() {
            return Err(CoreError::validation("plan id must not be empty"));
        }
        if self.max_concurrency == Some(0) {
            return Err(CoreError::validation(
                "plan max_concurrency must be greater than zero when provided",
            )
            .for_plan(&self.id));
        }

        let plan_id = self.id;
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for descriptor in self.tasks {
            let retry_policy = descriptor
                .retry_policy
                .unwrap_or_else(|| default_retry.clone());
            retry_policy
                .validate()
                .map_err(|error| error.for_plan(&plan_id).for_task(&descriptor.id))?;

            if descriptor.timeout_ms == Some(0) {
                return Err(CoreError::validation(
                    "task timeout must be greater than zero when provided",
                )
                .for_plan(&plan_id)
                .for_task(&descriptor.id));
            }

            let mut seen = HashSet::new();
            let depends_on = descriptor
                .depends_on
                .into_iter()
                .filter(|dependency| seen.insert(dependency.clone()))
                .collect();

            let mut task = Task::new(descriptor.id, descriptor.payload, depends_on, retry_policy);
            task.timeout = descriptor.timeout_ms.map(std::time::Duration::from_millis);
            tasks.push(task);
        }

        Ok(Plan {
            id: plan_id,
            name: self.name,
            tasks,
            metadata: self.metadata,
            created_at: SystemTime::now(),
            status: PlanStatus::Created,
            backend,
            max_concurrency: self.max_concurrency,
        })
    }
}

impl TaskDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(id),
            payload: Value::Null,
            depends_on: Vec::new(),
            retry_policy: None,
            timeout_ms: None,
        }
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(TaskId::new(dependency));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::PlanDescriptor;
    use crate::models::{CoreErrorKind, RetryPolicy, TaskId};

    #[test]
    fn parses_yaml_descriptor_with_defaults() {
        let descriptor = PlanDescriptor::from_yaml(
            r#"
id: research-42
name: Research pipeline
tasks:
  - id: search
    payload: { query: "rust schedulers" }
  - id: summarize
    depends_on: [search, search]
    retry_policy:
      max_attempts: 5
"#,
        )
        .unwrap();

        let plan = descriptor
            .into_plan("local".to_string(), &RetryPolicy::default())
            .unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec![TaskId::from("search")]);
        assert_eq!(plan.tasks[1].retry_policy.max_attempts, 5);
        assert_eq!(plan.tasks[0].retry_policy, RetryPolicy::default());
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let error = PlanDescriptor::from_json("{\"id\": 3").unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Validation);
    }
}
