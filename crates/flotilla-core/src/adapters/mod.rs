pub mod health;
pub mod local;

pub use health::{HealthPolicy, HealthTracker};
pub use local::{LocalExecutionAdapter, LocalWork, TaskCancellationToken};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::models::{AdapterHandle, CoreError, IdempotencyKey, TaskResult};

pub type AdapterResult<T> = Result<T, CoreError>;

pub type AdapterFuture<'a, T> = Pin<Box<dyn Future<Output = AdapterResult<T>> + Send + 'a>>;

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchRequest {
    pub key: IdempotencyKey,
    pub payload: Value,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Pending,
    Ready(TaskResult),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdapterHealth {
    Healthy,
    Unhealthy { reason: String },
}

/// Delivery modes a backend supports. `requery` means a handle stored before
/// a restart can still be polled afterwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdapterCapabilities {
    pub poll: bool,
    pub push: bool,
    pub requery: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            poll: true,
            push: false,
            requery: false,
        }
    }
}

/// A result delivered by the backend without being polled.
#[derive(Clone, Debug, PartialEq)]
pub struct PushedResult {
    pub key: IdempotencyKey,
    pub handle: AdapterHandle,
    pub result: TaskResult,
}

#[derive(Clone, Debug)]
pub struct ResultSink {
    sender: mpsc::UnboundedSender<PushedResult>,
}

impl ResultSink {
    pub fn new(sender: mpsc::UnboundedSender<PushedResult>) -> Self {
        Self { sender }
    }

    /// Returns false once the orchestrator stopped listening.
    pub fn deliver(&self, pushed: PushedResult) -> bool {
        self.sender.send(pushed).is_ok()
    }
}

/// Boundary to a concrete backend that performs task work. The orchestrator
/// never sees the backend's native types, only handles and results.
pub trait ExecutionAdapter: Send + Sync {
    fn kind(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities::default()
    }

    /// Must have at most one effect per idempotency key.
    fn dispatch(&self, request: DispatchRequest) -> AdapterFuture<'_, AdapterHandle>;

    fn poll(&self, handle: AdapterHandle) -> AdapterFuture<'_, PollOutcome>;

    /// Best effort; `true` when the backend acknowledged the request.
    fn cancel(&self, handle: AdapterHandle) -> AdapterFuture<'_, bool>;

    fn health(&self) -> AdapterFuture<'_, AdapterHealth> {
        Box::pin(async { Ok(AdapterHealth::Healthy) })
    }

    fn attach_sink(&self, _sink: ResultSink) {}
}
