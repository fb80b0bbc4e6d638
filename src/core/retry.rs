//! Fail-recovery strategies: retry policies with exponential backoff and the
//! custom recovery hook.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential-backoff retry policy.
///
/// The delay before 1-based attempt `k` is
/// `min(max_timeout, round(r * max(min_timeout, 1ms) * factor^(k-1)))`,
/// where `r` is 1 or, with [`randomize`](Self::randomize), uniform in `[1, 2)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub retries: u32,
    /// Delay before the first retry.
    pub min_timeout: Duration,
    /// Upper bound on any computed delay. `None` means unbounded.
    pub max_timeout: Option<Duration>,
    /// Backoff multiplier applied per attempt.
    pub factor: f64,
    /// Multiply each delay by a uniform random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            min_timeout: Duration::from_millis(1000),
            max_timeout: None,
            factor: 2.0,
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_min_timeout(mut self, min_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self
    }

    /// Cap every computed delay.
    #[must_use]
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = Some(max_timeout);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Enable random jitter in `[1, 2)`.
    #[must_use]
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let rand_factor = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        self.delay_with_factor(attempt, rand_factor)
    }

    /// Backoff formula with an explicit random factor, for deterministic use.
    pub(crate) fn delay_with_factor(&self, attempt: u32, rand_factor: f64) -> Duration {
        let base = (self.min_timeout.as_millis() as f64).max(1.0);
        let exponent = attempt.saturating_sub(1) as i32;
        let mut millis = (rand_factor * base * self.factor.powi(exponent)).round();
        if let Some(max) = self.max_timeout {
            millis = millis.min(max.as_millis() as f64);
        }
        Duration::from_millis(millis as u64)
    }
}

/// Outcome of a custom recovery hook.
#[derive(Debug)]
pub enum RecoveryDecision {
    /// Re-admit the task after the given delay.
    Retry {
        /// Time to wait before re-admission.
        delay: Duration,
    },
    /// Give up and settle the task with the given error.
    Fail {
        /// The error to deliver on the task's result channel.
        error: anyhow::Error,
    },
}

/// Caller-supplied hook consulted after a task failure.
///
/// `attempt` counts the retries already performed; it is 0 the first time a
/// given task fails. Returning an error from the hook settles the task with
/// [`SchedulerError::OnFailure`](crate::SchedulerError::OnFailure), retaining
/// the task's own error as a cause.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    /// Decide whether the failed task should be retried.
    async fn on_failure(
        &self,
        error: Arc<anyhow::Error>,
        attempt: u32,
    ) -> anyhow::Result<RecoveryDecision>;
}

/// What to do when a task's callback fails.
#[derive(Clone, Default)]
pub enum FailRecoveryStrategy {
    /// Report the error on the result channel unchanged.
    #[default]
    None,
    /// Retry with exponential backoff.
    Retry(RetryPolicy),
    /// Consult a caller-supplied hook per failure.
    Custom(Arc<dyn FailureHandler>),
}

impl fmt::Debug for FailRecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Retry(policy) => f.debug_tuple("Retry").field(policy).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}
