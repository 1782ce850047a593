use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::adapters::{
    AdapterCapabilities, AdapterFuture, DispatchRequest, ExecutionAdapter, PollOutcome,
    PushedResult, ResultSink,
};
use crate::models::{
    AdapterHandle, CoreError, CoreErrorKind, ExecutionError, IdempotencyKey, TaskResult,
};

pub type LocalWork = Arc<
    dyn Fn(
            DispatchRequest,
            TaskCancellationToken,
        ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutionError>> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone, Debug)]
pub struct TaskCancellationToken {
    flag: Arc<AtomicBool>,
}

impl TaskCancellationToken {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// In-process backend: each dispatch runs the supplied async work on the
/// tokio runtime. Dispatches are deduplicated by idempotency key.
#[derive(Clone)]
pub struct LocalExecutionAdapter {
    kind: String,
    work: LocalWork,
    inner: Arc<Mutex<LocalState>>,
    sink: Arc<std::sync::Mutex<Option<ResultSink>>>,
    push_delivery: bool,
    cancel_grace: Duration,
}

#[derive(Default)]
struct LocalState {
    next_handle: u64,
    effects: u64,
    by_key: HashMap<String, AdapterHandle>,
    runs: HashMap<AdapterHandle, LocalRun>,
}

struct LocalRun {
    key: IdempotencyKey,
    started_at: SystemTime,
    result: Option<TaskResult>,
    cancel_flag: Arc<AtomicBool>,
    abort_handle: Option<AbortHandle>,
    completion: Arc<Notify>,
}

impl LocalExecutionAdapter {
    pub fn new<F, Fut>(kind: impl Into<String>, work: F) -> Self
    where
        F: Fn(DispatchRequest, TaskCancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        let work: LocalWork = Arc::new(move |request, token| Box::pin(work(request, token)));
        Self {
            kind: kind.into(),
            work,
            inner: Arc::new(Mutex::new(LocalState::default())),
            sink: Arc::new(std::sync::Mutex::new(None)),
            push_delivery: false,
            cancel_grace: Duration::from_millis(100),
        }
    }

    /// Deliver results through the attached sink instead of waiting to be
    /// polled.
    pub fn with_push_delivery(mut self, push_delivery: bool) -> Self {
        self.push_delivery = push_delivery;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Number of dispatches that actually started work.
    pub async fn effect_count(&self) -> u64 {
        self.inner.lock().await.effects
    }

    pub async fn result_for(&self, handle: &AdapterHandle) -> Option<TaskResult> {
        let state = self.inner.lock().await;
        state.runs.get(handle).and_then(|run| run.result.clone())
    }

    /// Pushes the finished result of `handle` through the sink again.
    /// Returns false when the run is unknown or unfinished.
    pub async fn redeliver(&self, handle: &AdapterHandle) -> bool {
        let state = self.inner.lock().await;
        let Some(run) = state.runs.get(handle) else {
            return false;
        };
        let Some(result) = run.result.clone() else {
            return false;
        };
        push_result(&self.sink, run.key.clone(), handle, result)
    }

    /// Handles of every run started so far, oldest first.
    pub async fn handles(&self) -> Vec<AdapterHandle> {
        let state = self.inner.lock().await;
        let mut runs: Vec<(&AdapterHandle, SystemTime)> = state
            .runs
            .iter()
            .map(|(handle, run)| (handle, run.started_at))
            .collect();
        runs.sort_by_key(|(handle, started_at)| (*started_at, handle.0.clone()));
        runs.into_iter().map(|(handle, _)| handle.clone()).collect()
    }

    async fn dispatch_inner(&self, request: DispatchRequest) -> Result<AdapterHandle, CoreError> {
        let key_text = request.key.to_string();
        let (handle, cancel_flag, completion) = {
            let mut state = self.inner.lock().await;
            if let Some(existing) = state.by_key.get(&key_text).cloned() {
                tracing::debug!(
                    key = %key_text,
                    handle = %existing.0,
                    "duplicate dispatch collapsed onto existing run"
                );
                // A push already made may have been lost with the caller.
                if self.push_delivery
                    && let Some(run) = state.runs.get(&existing)
                    && let Some(result) = run.result.clone()
                {
                    push_result(&self.sink, run.key.clone(), &existing, result);
                }
                return Ok(existing);
            }

            let handle = AdapterHandle::new(format!("{}-{}", self.kind, state.next_handle));
            state.next_handle = state.next_handle.saturating_add(1);
            state.effects = state.effects.saturating_add(1);

            let cancel_flag = Arc::new(AtomicBool::new(false));
            let completion = Arc::new(Notify::new());
            state.by_key.insert(key_text, handle.clone());
            state.runs.insert(
                handle.clone(),
                LocalRun {
                    key: request.key.clone(),
                    started_at: SystemTime::now(),
                    result: None,
                    cancel_flag: cancel_flag.clone(),
                    abort_handle: None,
                    completion: completion.clone(),
                },
            );
            (handle, cancel_flag, completion)
        };

        let token = TaskCancellationToken::new(cancel_flag);
        let work = self.work.clone();
        let inner = self.inner.clone();
        let sink = self.sink.clone();
        let push_delivery = self.push_delivery;
        let run_handle = handle.clone();
        let key = request.key.clone();
        let started_at = SystemTime::now();

        let join_handle = tokio::spawn(async move {
            let outcome = work(request, token.clone()).await;
            let result = match outcome {
                _ if token.is_cancelled() => {
                    TaskResult::cancelled(key.task_id.clone(), key.attempt, started_at)
                }
                Ok(output) => {
                    TaskResult::succeeded(key.task_id.clone(), key.attempt, output, started_at)
                }
                Err(error) => {
                    TaskResult::failed(key.task_id.clone(), key.attempt, error, started_at)
                }
            };
            finish_run(&inner, &sink, push_delivery, &run_handle, result).await;
            completion.notify_waiters();
        });

        let mut state = self.inner.lock().await;
        if let Some(run) = state.runs.get_mut(&handle) {
            run.abort_handle = Some(join_handle.abort_handle());
        }

        Ok(handle)
    }

    async fn cancel_inner(&self, handle: AdapterHandle) -> Result<bool, CoreError> {
        let wait = {
            let state = self.inner.lock().await;
            let Some(run) = state.runs.get(&handle) else {
                return Ok(false);
            };
            if run.result.is_some() {
                return Ok(true);
            }
            run.cancel_flag.store(true, Ordering::SeqCst);
            let completion = run.completion.clone();
            (completion, run.abort_handle.clone())
        };

        let (completion, abort_handle) = wait;
        let notified = completion.notified();
        if timeout(self.cancel_grace, notified).await.is_err() {
            if let Some(abort_handle) = abort_handle {
                abort_handle.abort();
            }
            let (task_id, attempt, started_at) = {
                let state = self.inner.lock().await;
                match state.runs.get(&handle) {
                    Some(run) => (run.key.task_id.clone(), run.key.attempt, run.started_at),
                    None => return Ok(true),
                }
            };
            finish_run(
                &self.inner,
                &self.sink,
                self.push_delivery,
                &handle,
                TaskResult::cancelled(task_id, attempt, started_at),
            )
            .await;
            completion.notify_waiters();
        }

        Ok(true)
    }
}

impl ExecutionAdapter for LocalExecutionAdapter {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            poll: !self.push_delivery,
            push: self.push_delivery,
            requery: true,
        }
    }

    fn dispatch(&self, request: DispatchRequest) -> AdapterFuture<'_, AdapterHandle> {
        Box::pin(self.dispatch_inner(request))
    }

    fn poll(&self, handle: AdapterHandle) -> AdapterFuture<'_, PollOutcome> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            let run = state.runs.get(&handle).ok_or_else(|| {
                CoreError::new(
                    CoreErrorKind::NotFound,
                    format!("unknown local handle '{}'", handle.0),
                )
            })?;
            Ok(match &run.result {
                Some(result) => PollOutcome::Ready(result.clone()),
                None => PollOutcome::Pending,
            })
        })
    }

    fn cancel(&self, handle: AdapterHandle) -> AdapterFuture<'_, bool> {
        Box::pin(self.cancel_inner(handle))
    }

    fn attach_sink(&self, sink: ResultSink) {
        let mut slot = self
            .sink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(sink);
    }
}

async fn finish_run(
    inner: &Arc<Mutex<LocalState>>,
    sink: &Arc<std::sync::Mutex<Option<ResultSink>>>,
    push_delivery: bool,
    handle: &AdapterHandle,
    result: TaskResult,
) {
    let key = {
        let mut state = inner.lock().await;
        let Some(run) = state.runs.get_mut(handle) else {
            return;
        };
        if run.result.is_some() {
            return;
        }
        run.result = Some(result.clone());
        run.abort_handle = None;
        run.key.clone()
    };

    if push_delivery {
        push_result(sink, key, handle, result);
    }
}

fn push_result(
    sink: &Arc<std::sync::Mutex<Option<ResultSink>>>,
    key: IdempotencyKey,
    handle: &AdapterHandle,
    result: TaskResult,
) -> bool {
    let sink = sink
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    match sink {
        Some(sink) => {
            let delivered = sink.deliver(PushedResult {
                key,
                handle: handle.clone(),
                result,
            });
            if !delivered {
                tracing::warn!(handle = %handle.0, "result sink closed; pushed result dropped");
            }
            delivered
        }
        None => {
            tracing::warn!(handle = %handle.0, "push delivery enabled without an attached sink");
            false
        }
    }
}
