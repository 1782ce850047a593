use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::{OrchestrationResult, PersistenceRetry};
use crate::persistence::{PersistenceResult, StateStore};

/// Runs a blocking store call off the async runtime. Storage failures are
/// retried with a fixed delay; conflicts and not-found are returned at once.
pub(crate) async fn call_store<T, F>(
    store: &Arc<dyn StateStore>,
    retry: PersistenceRetry,
    operation: &'static str,
    call: F,
) -> OrchestrationResult<T>
where
    T: Send + 'static,
    F: Fn(&dyn StateStore) -> PersistenceResult<T> + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let store = store.clone();
        let call = call.clone();
        let outcome = tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|join_error| {
                CoreError::new(
                    CoreErrorKind::Internal,
                    format!("state store '{operation}' join failure: {join_error}"),
                )
            })?;

        match outcome {
            Err(error) if error.is_retryable_storage() && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    kind = ?error.kind,
                    message = %error.message,
                    "state store call failed; retrying"
                );
                tokio::time::sleep(retry.delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
