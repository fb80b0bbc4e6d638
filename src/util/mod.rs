//! Shared utilities: clock and telemetry.

pub mod clock;
pub mod telemetry;

pub use clock::millis_since;
pub use telemetry::init_tracing;
