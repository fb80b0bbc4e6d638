//! Monotonic millisecond clock helpers.

use std::time::Instant;

/// Milliseconds elapsed since `anchor`, truncated to whole milliseconds.
pub fn millis_since(anchor: Instant) -> u64 {
    anchor.elapsed().as_millis() as u64
}
