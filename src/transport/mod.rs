//! Transport layer for the telemetry agent
//!
//! The link stack is built from two seams:
//!
//! - [`MqttBackend`] - the TLS + MQTT library behind the transport session and
//!   broker link (rumqttc in production, a simulated broker in tests)
//! - [`NetworkDriver`] - network association (the host network stack in
//!   production, a simulated access point in tests)
//!
//! Everything above the seams (session, link, supervisor) is backend agnostic.

use crate::config::BrokerEndpoint;
use crate::error::AgentResult;
use crate::protocol::InboundMessage;
use bytes::Bytes;
use std::time::Duration;

pub mod mqtt;
pub mod network;

pub use mqtt::{BrokerLink, TransportSession, TrustMaterial};
pub use network::HostNetwork;

/// What a backend poll produced
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A publish arrived on a subscribed topic
    Message(InboundMessage),
    /// Any other inbound packet; proves the link is alive
    Activity,
}

/// TLS + MQTT library contract
///
/// Implementations hold the only live socket. Every async operation must
/// honour the timeout it is given.
#[async_trait::async_trait]
pub trait MqttBackend: Send {
    /// Install trust material and make the endpoint reachable
    async fn open(
        &mut self,
        endpoint: &BrokerEndpoint,
        trust: &TrustMaterial,
        timeout: Duration,
    ) -> AgentResult<()>;

    /// Run the MQTT CONNECT / CONNACK exchange
    ///
    /// Returns the keepalive in effect for the session, which is the broker's
    /// override when the CONNACK carries one.
    async fn handshake(
        &mut self,
        client_id: &str,
        keep_alive: Duration,
        timeout: Duration,
    ) -> AgentResult<Duration>;

    /// Subscribe to one filter and wait for the broker to acknowledge it
    async fn subscribe(&mut self, filter: &str, timeout: Duration) -> AgentResult<()>;

    /// Queue a publish without waiting on the network
    ///
    /// A full request queue is reported as `Backpressure`; the session stays up.
    fn publish(&mut self, topic: &str, payload: Bytes) -> AgentResult<()>;

    /// Wait up to `timeout` for the next inbound event
    async fn poll(&mut self, timeout: Duration) -> AgentResult<Option<BackendEvent>>;

    /// Tear down the socket; idempotent
    async fn close(&mut self);
}

/// Network association contract
#[async_trait::async_trait]
pub trait NetworkDriver: Send {
    /// Associate with the named network; callers bound this with a timeout
    async fn associate(&mut self, ssid: &str, secret: &str) -> AgentResult<()>;

    /// Whether the association is currently up
    fn is_associated(&self) -> bool;
}
