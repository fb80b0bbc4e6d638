//! Periodic capacity-release rules and their dormancy catch-up arithmetic.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::core::error::SchedulerError;

/// A periodic rule that lowers used capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReleaseRule {
    /// Set used capacity to `value` every `interval`.
    Reset {
        /// Capacity level to reset to.
        #[serde(default)]
        value: f64,
        /// Firing period.
        interval: Duration,
    },
    /// Subtract `value` from used capacity every `interval`, floored at zero.
    Reduce {
        /// Amount subtracted per firing.
        value: f64,
        /// Firing period.
        interval: Duration,
    },
}

impl ReleaseRule {
    /// Firing period in whole milliseconds.
    pub(crate) fn interval_ms(&self) -> u64 {
        match self {
            Self::Reset { interval, .. } | Self::Reduce { interval, .. } => {
                interval.as_millis() as u64
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Reset { value, interval } => {
                if *value < 0.0 || !value.is_finite() {
                    return Err(SchedulerError::InvalidArgument(
                        "reset rule value must be non-negative".into(),
                    ));
                }
                if interval.is_zero() {
                    return Err(SchedulerError::InvalidArgument(
                        "release rule interval must be positive".into(),
                    ));
                }
            }
            Self::Reduce { value, interval } => {
                if *value <= 0.0 || !value.is_finite() {
                    return Err(SchedulerError::InvalidArgument(
                        "reduce rule value must be positive".into(),
                    ));
                }
                if interval.is_zero() {
                    return Err(SchedulerError::InvalidArgument(
                        "release rule interval must be positive".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-rule runtime state.
pub(crate) struct RuleState {
    pub rule: ReleaseRule,
    /// Monotonic milliseconds of the last (possibly catch-up) application.
    pub last_applied: u64,
    /// Identity of the currently armed timer; a fired timer whose token no
    /// longer matches any rule exits quietly.
    pub token: u64,
    pub timer: Option<JoinHandle<()>>,
}

impl RuleState {
    pub fn new(rule: ReleaseRule, now_ms: u64, token: u64) -> Self {
        Self {
            rule,
            last_applied: now_ms,
            token,
            timer: None,
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Delay until this rule's next firing, measured from `now_ms`.
    pub fn residual_delay(&self, now_ms: u64) -> Duration {
        let interval = self.rule.interval_ms();
        let elapsed = now_ms.saturating_sub(self.last_applied);
        Duration::from_millis(interval.saturating_sub(elapsed).max(1))
    }
}

/// Apply every firing the rules missed while their timers were dormant.
///
/// Among resets with at least one missed firing, only the one whose catch-up
/// moment is latest fires; it supersedes the earlier ones, whose
/// `last_applied` still advances to their own catch-up moment. Each reduce
/// rule then applies `floor((catch_up - max(last_applied, latest_reset)) /
/// interval)` firings, provided capacity is in use, and advances.
pub(crate) fn apply_catch_up(rules: &mut [RuleState], used_capacity: &mut f64, now_ms: u64) {
    let mut latest_reset: Option<(u64, usize)> = None;
    for (idx, state) in rules.iter().enumerate() {
        if let ReleaseRule::Reset { .. } = state.rule {
            if let Some(catch) = catch_up_moment(state, now_ms) {
                if latest_reset.map_or(true, |(t, _)| catch > t) {
                    latest_reset = Some((catch, idx));
                }
            }
        }
    }

    if let Some((_, idx)) = latest_reset {
        if let ReleaseRule::Reset { value, .. } = rules[idx].rule {
            *used_capacity = value;
        }
        for state in rules.iter_mut() {
            if let ReleaseRule::Reset { .. } = state.rule {
                if let Some(catch) = catch_up_moment(state, now_ms) {
                    state.last_applied = catch;
                }
            }
        }
    }

    let reset_moment = latest_reset.map(|(t, _)| t);
    for state in rules.iter_mut() {
        if let ReleaseRule::Reduce { value, .. } = state.rule {
            if let Some(catch) = catch_up_moment(state, now_ms) {
                let interval = state.rule.interval_ms();
                let start = reset_moment.map_or(state.last_applied, |r| state.last_applied.max(r));
                if *used_capacity > 0.0 && catch > start {
                    let firings = (catch - start) / interval;
                    if firings > 0 {
                        *used_capacity = (*used_capacity - value * firings as f64).max(0.0);
                    }
                }
                state.last_applied = catch;
            }
        }
    }
}

/// The most recent scheduled firing at or before `now_ms`, or `None` if no
/// full interval has elapsed since `last_applied`.
fn catch_up_moment(state: &RuleState, now_ms: u64) -> Option<u64> {
    let interval = state.rule.interval_ms();
    let elapsed = now_ms.saturating_sub(state.last_applied);
    if elapsed < interval {
        return None;
    }
    Some(now_ms - elapsed % interval)
}
