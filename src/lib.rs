//! Telemetry Agent
//!
//! A device-side agent that keeps a mutually authenticated MQTT link to a cloud
//! broker alive over a flaky network, publishes a numeric metric on a fixed
//! period and dispatches JSON commands received on a command topic.
//!
//! # Overview
//!
//! - [`transport`] - transport session, broker link with persisted
//!   subscriptions, rumqttc backend and network driver seams
//! - [`agent`] - reconnection supervisor, command dispatcher, telemetry
//!   publisher, metric sources and the single-task runtime
//! - [`protocol`] - inbound command and outbound sample wire formats, topic rules
//! - [`config`] - TOML configuration and the immutable credential bundle
//! - [`observability`] - structured logging and link statistics
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_agent::protocol::{Command, MetricSample, MetricValue};
//!
//! let command = Command::decode(
//!     "esp32/SmartParking/commands",
//!     br#"{"message":"OPEN_GATE","gate":2}"#,
//! )
//! .unwrap();
//! assert_eq!(command.name, "OPEN_GATE");
//!
//! let payload = MetricSample::new("metrics", MetricValue::from(42))
//!     .encode(256)
//!     .unwrap();
//! assert_eq!(payload, br#"{"metrics":42}"#.to_vec());
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{AgentRuntime, CommandDispatcher, ReconnectionSupervisor, TelemetryPublisher};
pub use config::{AgentConfig, ConfigError, Credentials};
pub use error::{AgentError, AgentResult};
pub use transport::mqtt::ConnectionState;
