//! # capflow
//!
//! A capacity-aware asynchronous task scheduler for the tokio runtime.
//!
//! The scheduler multiplexes caller-supplied units of work over an abstract
//! *capacity* budget — memory pages, API tokens, connection slots, whatever
//! the caller decides — while honoring priority, ageing, per-task and global
//! timeouts, retry policies and periodic capacity-release rules.
//!
//! ## Modules
//!
//! - [`core`] - the scheduling engine: tasks, queue, release rules, retry
//! - [`config`] - scheduler options, strategies and validation
//! - [`util`] - clock and telemetry helpers
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use capflow::{Scheduler, SchedulerOptions, TaskParams};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let scheduler: Scheduler<u64> = Scheduler::new(
//!         SchedulerOptions::new()
//!             .with_max_capacity(10.0)
//!             .with_max_queue_size(100)
//!             .with_execution_timeout(Duration::from_secs(30)),
//!     )?;
//!
//!     // A light task and a heavy one; the scheduler packs them under the
//!     // capacity budget and queues whatever does not fit.
//!     let light = scheduler.schedule(|| async { Ok(1) })?;
//!     let heavy = scheduler.schedule_task(
//!         TaskParams::new().with_capacity(8.0).with_priority(1),
//!         || async { Ok(2) },
//!     )?;
//!
//!     assert_eq!(light.await? + heavy.await?, 3);
//!     scheduler.stop(Default::default()).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Semantics worth knowing
//!
//! - Running callbacks are never cancelled. An execution timeout disowns the
//!   result; the work itself runs to its natural end.
//! - A pending task whose waiting limit elapses is promoted ahead of every
//!   priority. If it does not fit the remaining capacity, the queue blocks
//!   behind it rather than starving it with smaller tasks.
//! - Under the `claim` capacity strategy, finished tasks keep their capacity
//!   occupied; only release rules or manual adjustment give it back.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod util;

// Re-export main types for convenience
pub use crate::config::{
    CapacityStrategy, QueueOverflowStrategy, SchedulerOptions, TaskExceedsCapacityStrategy,
};
pub use crate::core::error::SchedulerError;
pub use crate::core::release::ReleaseRule;
pub use crate::core::retry::{FailRecoveryStrategy, FailureHandler, RecoveryDecision, RetryPolicy};
pub use crate::core::scheduler::{Scheduler, SchedulerStats, StopParams};
pub use crate::core::task::{TaskFn, TaskFuture, TaskHandle, TaskParams};
