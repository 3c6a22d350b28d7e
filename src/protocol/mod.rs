//! Wire protocol for the telemetry agent
//!
//! Message shapes and topic rules for the command and telemetry topics.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
