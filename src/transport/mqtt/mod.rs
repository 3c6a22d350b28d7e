//! MQTT link stack
//!
//! Pure logic and I/O are kept apart:
//!
//! - [`connection`] - connection state, backoff configuration, rumqttc options
//! - [`health_monitor`] - pure state transitions and reconnection decisions
//! - [`message_handler`] - pure routing and classification of rumqttc events
//! - [`session`] - transport session and trust material
//! - [`link`] - broker link with persisted subscriptions
//! - [`client`] - rumqttc backend
//!
//! # Usage
//!
//! ```rust,no_run
//! use telemetry_agent::config::{AgentConfig, Credentials};
//! use telemetry_agent::transport::mqtt::{BrokerLink, RumqttcBackend};
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = AgentConfig::load_from_file(Path::new("telemetry-agent.toml"))?;
//! let credentials = Credentials::load(&config)?;
//!
//! let mut link = BrokerLink::new(RumqttcBackend::new(), config.reconnect_config());
//! link.subscribe(&config.subscribe_topic()).await?;
//! link.open_session(&credentials).await?;
//! link.connect(&credentials.client_id).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod link;
pub mod message_handler;
pub mod session;

// Re-export public types for convenience
pub use client::RumqttcBackend;
pub use connection::{configure_mqtt_options, ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use link::BrokerLink;
pub use message_handler::{EventRoute, MessageHandler};
pub use session::{TransportSession, TrustMaterial};
