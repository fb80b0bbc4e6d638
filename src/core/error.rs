//! Error types for scheduler operations.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the scheduler.
///
/// Synchronous misuse (`InvalidArgument`, `InvalidCall`, and
/// `MaxCapacityExceeded` under the throw strategy) is returned at the call
/// site. Everything else is delivered through a task's result channel.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// An argument was outside its allowed range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation was called in a configuration that does not support it.
    #[error("invalid call: {0}")]
    InvalidCall(String),
    /// Task capacity is larger than the configured maximum capacity.
    #[error("task capacity exceeds the configured maximum capacity")]
    MaxCapacityExceeded,
    /// The pending queue is full and the task was rejected or evicted.
    #[error("queue size limit reached")]
    QueueSizeExceeded,
    /// The task spent longer than its waiting timeout in the queue.
    #[error("task timed out waiting in the queue")]
    QueueTimeout,
    /// The task ran longer than its execution timeout. The underlying work
    /// keeps running; only its result is disowned.
    #[error("task execution timed out")]
    ExecutionTimeout,
    /// A custom failure-recovery hook itself failed. The error that the task
    /// originally failed with is retained alongside the hook's error.
    #[error("failure-recovery hook failed: {handler_error} (task error: {task_error})")]
    OnFailure {
        /// Error raised by the recovery hook.
        handler_error: Arc<anyhow::Error>,
        /// The task failure the hook was consulted about.
        task_error: Arc<anyhow::Error>,
    },
    /// The scheduler has been stopped.
    #[error("scheduler stopped")]
    Stopped,
    /// The task's own failure, reported after the fail-recovery strategy
    /// exhausted or declined to retry.
    #[error("task failed: {0}")]
    Task(Arc<anyhow::Error>),
}

impl SchedulerError {
    /// Wrap a task failure for delivery on the result channel.
    pub(crate) fn task(err: Arc<anyhow::Error>) -> Self {
        Self::Task(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            SchedulerError::InvalidArgument("priority must be in 0..=9".into()).to_string(),
            "invalid argument: priority must be in 0..=9"
        );
        assert_eq!(
            SchedulerError::QueueSizeExceeded.to_string(),
            "queue size limit reached"
        );
        assert_eq!(SchedulerError::Stopped.to_string(), "scheduler stopped");
    }

    #[test]
    fn task_error_retains_message() {
        let err = SchedulerError::task(Arc::new(anyhow::anyhow!("backend unavailable")));
        assert!(err.to_string().contains("backend unavailable"));
    }
}
