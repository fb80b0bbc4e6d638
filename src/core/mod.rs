//! Core scheduling engine: task records, pending indices, capacity
//! accounting, release rules, fail recovery and the scheduler itself.

pub mod error;
pub mod release;
pub mod retry;
pub mod scheduler;
pub mod task;

pub(crate) mod capacity;
pub(crate) mod queue;

pub use error::SchedulerError;
pub use release::ReleaseRule;
pub use retry::{FailRecoveryStrategy, FailureHandler, RecoveryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerStats, StopParams};
pub use task::{TaskFn, TaskFuture, TaskHandle, TaskParams};
