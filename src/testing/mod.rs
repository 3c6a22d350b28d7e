//! Testing utilities and mock implementations
//!
//! Simulated broker, network, handlers and metric sources for exercising the
//! agent without a real access point or MQTT broker.

pub mod mocks;

pub use mocks::*;
