//! Observability for the telemetry agent
//!
//! Structured logging setup and in-process link statistics.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{LinkStats, StatsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, lifecycle_span, link_span, telemetry_span};
