//! Scheduler configuration: options, strategies and validation.

pub mod options;

pub use options::{
    release_rules_from_json, CapacityStrategy, QueueOverflowStrategy, SchedulerOptions,
    TaskExceedsCapacityStrategy,
};
