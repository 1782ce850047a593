use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{ExecutionAdapter, HealthPolicy, HealthTracker};
use crate::models::{CoreError, CoreErrorKind};

/// A backend bound to the health tracker the scheduler consults before
/// dispatching to it.
#[derive(Clone)]
pub struct RegisteredAdapter {
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub health: Arc<HealthTracker>,
}

/// Execution backends keyed by their `kind()`.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ExecutionAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ExecutionAdapter>) -> Result<(), CoreError> {
        let kind = adapter.kind().trim().to_string();
        if kind.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "adapter kind must not be empty",
            ));
        }
        if self.adapters.contains_key(&kind) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("duplicate adapter registration for backend '{kind}'"),
            ));
        }

        self.adapters.insert(kind, adapter);
        Ok(())
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ExecutionAdapter>) -> Result<Self, CoreError> {
        self.register(adapter)?;
        Ok(self)
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn ExecutionAdapter>> {
        self.adapters.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// One health tracker per backend, shared by every plan using it.
    pub(crate) fn bind(&self, policy: &HealthPolicy) -> BTreeMap<String, RegisteredAdapter> {
        self.adapters
            .iter()
            .map(|(kind, adapter)| {
                let registered = RegisteredAdapter {
                    adapter: adapter.clone(),
                    health: Arc::new(HealthTracker::new(policy.clone())),
                };
                (kind.clone(), registered)
            })
            .collect()
    }

    /// Picks the backend for a plan: the requested kind, then the configured
    /// default, then the only registered backend.
    pub fn resolve_kind(
        &self,
        requested: Option<&str>,
        default_backend: Option<&str>,
    ) -> Result<String, CoreError> {
        if let Some(kind) = requested.or(default_backend) {
            if self.adapters.contains_key(kind) {
                return Ok(kind.to_string());
            }
            return Err(CoreError::validation(format!(
                "no execution adapter is registered for backend '{kind}'"
            )));
        }

        let mut kinds = self.adapters.keys();
        match (kinds.next(), kinds.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(CoreError::validation(
                "no execution adapters are registered",
            )),
            (Some(_), Some(_)) => Err(CoreError::validation(
                "plan does not name a backend and no default backend is configured",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::Value;

    use super::AdapterRegistry;
    use crate::adapters::{ExecutionAdapter, HealthPolicy, LocalExecutionAdapter};
    use crate::models::CoreErrorKind;

    fn local(kind: &str) -> Arc<LocalExecutionAdapter> {
        Arc::new(LocalExecutionAdapter::new(kind, |_, _| async { Ok(Value::Null) }))
    }

    #[test]
    fn rejects_duplicate_kind() {
        let mut registry = AdapterRegistry::new();
        registry.register(local("local")).unwrap();
        let error = registry.register(local("local")).unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::InvalidInput);
    }

    #[test]
    fn resolves_requested_default_then_single() {
        let registry = AdapterRegistry::new().with_adapter(local("only")).unwrap();
        assert_eq!(registry.resolve_kind(None, None).unwrap(), "only");
        assert!(registry.resolve_kind(Some("missing"), None).is_err());

        let registry = registry.with_adapter(local("second")).unwrap();
        assert!(registry.resolve_kind(None, None).is_err());
        assert_eq!(registry.resolve_kind(None, Some("second")).unwrap(), "second");
        assert_eq!(
            registry.resolve_kind(Some("only"), Some("second")).unwrap(),
            "only"
        );
    }

    #[test]
    fn bound_backends_track_health_separately() {
        let registry = AdapterRegistry::new()
            .with_adapter(local("a"))
            .unwrap()
            .with_adapter(local("b"))
            .unwrap();
        let policy = HealthPolicy {
            failure_threshold: 1,
            cool_down: Duration::from_secs(60),
        };
        let bound = registry.bind(&policy);

        assert!(bound["a"].health.record_failure());
        assert!(!bound["a"].health.is_available());
        assert!(bound["b"].health.is_available());
        assert_eq!(bound["b"].adapter.kind(), "b");
    }
}
