//! Task records, per-task parameters and the caller-facing result handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::core::error::SchedulerError;
use crate::core::retry::FailRecoveryStrategy;

/// Identifier of a scheduled task. Ids are allocated monotonically and never
/// reused, so a stale id held by a late-firing timer is a safe no-op.
pub(crate) type TaskId = u64;

/// The boxed future a task callback produces on each invocation.
pub type TaskFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

/// A task's work producer. Invoked once per attempt, so retried tasks call it
/// again for every new attempt.
pub type TaskFn<T> = Arc<dyn Fn() -> TaskFuture<T> + Send + Sync>;

/// Per-task parameters. Every field except `capacity` and `priority`
/// overrides the scheduler-level option of the same name when set.
#[derive(Clone, Default)]
pub struct TaskParams {
    /// Capacity the task occupies while running. Defaults to 1.
    pub capacity: Option<f64>,
    /// Priority in `0..=9`, lower is more urgent. Defaults to 5.
    pub priority: Option<u8>,
    /// Per-task execution timeout override.
    pub execution_timeout: Option<Duration>,
    /// Per-task queue-waiting-limit override (ageing threshold).
    pub queue_waiting_limit: Option<Duration>,
    /// Per-task queue-waiting-timeout override.
    pub queue_waiting_timeout: Option<Duration>,
    /// Per-task fail-recovery strategy override.
    pub fail_recovery: Option<FailRecoveryStrategy>,
}

impl TaskParams {
    /// Create empty parameters (scheduler defaults apply).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the task priority (`0..=9`, lower is more urgent).
    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the execution timeout for this task.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Override the queue waiting limit for this task.
    #[must_use]
    pub fn with_queue_waiting_limit(mut self, limit: Duration) -> Self {
        self.queue_waiting_limit = Some(limit);
        self
    }

    /// Override the queue waiting timeout for this task.
    #[must_use]
    pub fn with_queue_waiting_timeout(mut self, timeout: Duration) -> Self {
        self.queue_waiting_timeout = Some(timeout);
        self
    }

    /// Override the fail-recovery strategy for this task.
    #[must_use]
    pub fn with_fail_recovery(mut self, strategy: FailRecoveryStrategy) -> Self {
        self.fail_recovery = Some(strategy);
        self
    }
}

/// Awaitable result of a scheduled task.
///
/// Resolves exactly once with either the task's output or a typed
/// [`SchedulerError`]. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    pub(crate) rx: oneshot::Receiver<Result<T, SchedulerError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|r| match r {
            Ok(settled) => settled,
            // Sender dropped without settling: the scheduler itself was
            // dropped while the task was still owned by it.
            Err(_) => Err(SchedulerError::Stopped),
        })
    }
}

/// Internal task record. Exclusively owned by exactly one scheduler set at a
/// time: the pending queue, the executing set, or the retry set.
pub(crate) struct Task<T> {
    pub id: TaskId,
    pub capacity: f64,
    pub priority: u8,
    /// Admission sequence number; assigned on (re-)insertion into the queue.
    pub seq: u64,
    /// Monotonic milliseconds at the most recent admission.
    pub time_added: u64,
    /// Ageing deadline in monotonic milliseconds. A retry re-admission keeps
    /// the deadline from the first admission.
    pub time_limit: Option<u64>,
    /// Number of retry attempts performed so far; 0 if the task never failed.
    pub retry_attempt: u32,
    pub params: TaskParams,
    pub callback: TaskFn<T>,
    /// Single-shot result channel; taken when the task settles.
    pub tx: Option<oneshot::Sender<Result<T, SchedulerError>>>,
    /// Queue-waiting-timeout timer, armed while the task is pending.
    pub waiting_timer: Option<JoinHandle<()>>,
}

impl<T> Task<T> {
    /// Cancel the waiting-timeout timer if armed.
    pub fn cancel_waiting_timer(&mut self) {
        if let Some(timer) = self.waiting_timer.take() {
            timer.abort();
        }
    }
}
