//! Scheduler options and their validation rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::SchedulerError;
use crate::core::release::ReleaseRule;
use crate::core::retry::FailRecoveryStrategy;

/// How a running task's capacity charge is treated after it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStrategy {
    /// Capacity is occupied only for the execution lifetime and returned on
    /// completion, failure or timeout.
    #[default]
    Reserve,
    /// Capacity stays occupied after completion; only release rules or manual
    /// adjustment restore it.
    Claim,
}

/// What to do when a task's capacity exceeds the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskExceedsCapacityStrategy {
    /// Reject the submission at the call site.
    #[default]
    ThrowError,
    /// Clamp the task's capacity to the maximum; it will wait until the whole
    /// capacity is free.
    WaitForFullCapacity,
}

/// What to do when admission would exceed the maximum queue size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflowStrategy {
    /// Reject the newcomer.
    #[default]
    ThrowError,
    /// Evict the oldest pending task to make room.
    Replace,
    /// Evict the lowest-priority pending task, but only if it is strictly
    /// lower-priority than the newcomer; otherwise reject the newcomer.
    ReplaceByPriority,
}

/// Scheduler configuration.
///
/// Built with `with_*` methods and validated on construction and on every
/// [`set_options`](crate::Scheduler::set_options) call.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use capflow::{CapacityStrategy, SchedulerOptions};
///
/// let options = SchedulerOptions::new()
///     .with_max_capacity(100.0)
///     .with_capacity_strategy(CapacityStrategy::Reserve)
///     .with_max_queue_size(1000)
///     .with_execution_timeout(Duration::from_secs(60));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchedulerOptions {
    /// Maximum total capacity occupied by running tasks.
    pub max_capacity: Option<f64>,
    /// Capacity already in use when the scheduler starts.
    pub initially_used_capacity: Option<f64>,
    /// Reserve or claim semantics; requires `max_capacity`.
    pub capacity_strategy: Option<CapacityStrategy>,
    /// Policy for tasks whose capacity exceeds `max_capacity`.
    pub task_exceeds_max_capacity_strategy: TaskExceedsCapacityStrategy,
    /// Maximum number of concurrently executing tasks.
    pub max_concurrent: Option<u32>,
    /// Maximum number of pending tasks.
    pub max_queue_size: Option<usize>,
    /// Policy applied when the queue is full.
    pub queue_size_exceeded_strategy: QueueOverflowStrategy,
    /// Pending time after which a task is promoted ahead of all priorities.
    pub queue_waiting_limit: Option<Duration>,
    /// Pending time after which a task fails with a queue timeout.
    pub queue_waiting_timeout: Option<Duration>,
    /// Running time after which a task's result is disowned.
    pub execution_timeout: Option<Duration>,
    /// Minimum wall-time gap between successive dispatches.
    pub min_delay_between_tasks: Option<Duration>,
    /// Default fail-recovery strategy for tasks without an override.
    pub fail_recovery: FailRecoveryStrategy,
    /// Periodic capacity-release rules; require `max_capacity`.
    pub release_rules: Vec<ReleaseRule>,
}

impl SchedulerOptions {
    /// Create empty options: unbounded capacity and concurrency, no timeouts,
    /// no recovery.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum total capacity.
    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: f64) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    /// Set the capacity already in use at start.
    #[must_use]
    pub fn with_initially_used_capacity(mut self, used: f64) -> Self {
        self.initially_used_capacity = Some(used);
        self
    }

    /// Set the capacity strategy.
    #[must_use]
    pub fn with_capacity_strategy(mut self, strategy: CapacityStrategy) -> Self {
        self.capacity_strategy = Some(strategy);
        self
    }

    /// Set the over-capacity submission policy.
    #[must_use]
    pub fn with_task_exceeds_max_capacity_strategy(
        mut self,
        strategy: TaskExceedsCapacityStrategy,
    ) -> Self {
        self.task_exceeds_max_capacity_strategy = strategy;
        self
    }

    /// Set the maximum number of concurrently executing tasks.
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    /// Set the maximum queue size.
    #[must_use]
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = Some(max_queue_size);
        self
    }

    /// Set the queue-overflow policy.
    #[must_use]
    pub fn with_queue_size_exceeded_strategy(mut self, strategy: QueueOverflowStrategy) -> Self {
        self.queue_size_exceeded_strategy = strategy;
        self
    }

    /// Set the ageing threshold.
    #[must_use]
    pub fn with_queue_waiting_limit(mut self, limit: Duration) -> Self {
        self.queue_waiting_limit = Some(limit);
        self
    }

    /// Set the queue waiting timeout.
    #[must_use]
    pub fn with_queue_waiting_timeout(mut self, timeout: Duration) -> Self {
        self.queue_waiting_timeout = Some(timeout);
        self
    }

    /// Set the execution timeout.
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Set the minimum gap between dispatches.
    #[must_use]
    pub fn with_min_delay_between_tasks(mut self, delay: Duration) -> Self {
        self.min_delay_between_tasks = Some(delay);
        self
    }

    /// Set the default fail-recovery strategy.
    #[must_use]
    pub fn with_fail_recovery(mut self, strategy: FailRecoveryStrategy) -> Self {
        self.fail_recovery = strategy;
        self
    }

    /// Set the capacity-release rules.
    #[must_use]
    pub fn with_release_rules(mut self, rules: Vec<ReleaseRule>) -> Self {
        self.release_rules = rules;
        self
    }

    /// The effective capacity strategy (`Reserve` unless configured).
    pub(crate) fn effective_capacity_strategy(&self) -> CapacityStrategy {
        self.capacity_strategy.unwrap_or_default()
    }

    /// Validate option values and cross-field requirements.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if let Some(max) = self.max_capacity {
            if max < 0.0 || !max.is_finite() {
                return Err(SchedulerError::InvalidArgument(
                    "max_capacity must be non-negative".into(),
                ));
            }
        }
        if let Some(used) = self.initially_used_capacity {
            let Some(max) = self.max_capacity else {
                return Err(SchedulerError::InvalidCall(
                    "cannot set initially_used_capacity without max_capacity".into(),
                ));
            };
            if used < 0.0 || used > max || !used.is_finite() {
                return Err(SchedulerError::InvalidArgument(
                    "initially_used_capacity must be within 0..=max_capacity".into(),
                ));
            }
        }
        if !self.release_rules.is_empty() && self.max_capacity.is_none() {
            return Err(SchedulerError::InvalidArgument(
                "cannot use release_rules without max_capacity".into(),
            ));
        }
        if self.capacity_strategy.is_some() && self.max_capacity.is_none() {
            return Err(SchedulerError::InvalidArgument(
                "cannot use capacity_strategy without max_capacity".into(),
            ));
        }
        for rule in &self.release_rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// Parse a release-rule list from a JSON array and validate it.
///
/// ```
/// use capflow::config::release_rules_from_json;
///
/// let rules = release_rules_from_json(
///     r#"[{"kind":"reset","value":0.0,"interval":{"secs":60,"nanos":0}}]"#,
/// )
/// .unwrap();
/// assert_eq!(rules.len(), 1);
/// ```
pub fn release_rules_from_json(input: &str) -> Result<Vec<ReleaseRule>, SchedulerError> {
    let rules: Vec<ReleaseRule> = serde_json::from_str(input)
        .map_err(|e| SchedulerError::InvalidArgument(format!("release rule parse error: {e}")))?;
    for rule in &rules {
        rule.validate()?;
    }
    Ok(rules)
}
