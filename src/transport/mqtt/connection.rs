//! Pure connection state management for the broker link
//!
//! This module contains the connection state enum, backoff configuration and
//! the pure construction of rumqttc options from the credential bundle.

use crate::config::BrokerEndpoint;
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::fmt;
use std::time::Duration;

/// Shortest keepalive rumqttc accepts
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Longest keepalive expressible in the CONNECT packet
pub const MAX_KEEP_ALIVE: Duration = Duration::from_secs(u16::MAX as u64);

/// Connection state of the agent, owned by the reconnection supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No network association and no broker session
    Disconnected,
    /// Associating with the network
    WiFiConnecting,
    /// Network associated, broker session not yet opened
    WiFiConnected,
    /// TLS session open, MQTT handshake and re-subscription in progress
    BrokerConnecting,
    /// Handshake done and every subscription re-applied
    BrokerConnected,
    /// Last attempt was rejected on authentication grounds
    Failed,
}

impl ConnectionState {
    /// States in which the supervisor waits for the backoff cooldown
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::WiFiConnecting => "WiFiConnecting",
            ConnectionState::WiFiConnected => "WiFiConnected",
            ConnectionState::BrokerConnecting => "BrokerConnecting",
            ConnectionState::BrokerConnected => "BrokerConnected",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Reconnection and timeout configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// First retry delay; doubled per consecutive failure
    pub base_delay: Duration,
    /// Upper bound for any retry delay
    pub max_delay: Duration,
    /// Connected time after which the backoff returns to `base_delay`
    pub reset_after: Duration,
    /// Bound on network association
    pub network_timeout: Duration,
    /// Bound on session open, MQTT handshake and each re-subscription
    pub connect_timeout: Duration,
    /// MQTT keepalive interval
    pub keep_alive: Duration,
    /// Consecutive authentication failures before operator escalation
    pub auth_failure_escalation: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            reset_after: Duration::from_secs(60),
            network_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(60),
            auth_failure_escalation: 3,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    /// capped at `max_delay`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Silence after which a link with the configured keepalive is dead
    pub fn keepalive_deadline(&self) -> Duration {
        keepalive_deadline(self.keep_alive)
    }
}

/// Silence after which a link negotiated at `keep_alive` is dead
pub fn keepalive_deadline(keep_alive: Duration) -> Duration {
    keep_alive.saturating_mul(3) / 2
}

/// Clamp a keepalive into the range the MQTT client accepts
pub fn effective_keep_alive(keep_alive: Duration) -> Duration {
    keep_alive.clamp(MIN_KEEP_ALIVE, MAX_KEEP_ALIVE)
}

/// Build rumqttc options for one handshake attempt
pub fn configure_mqtt_options(
    client_id: &str,
    endpoint: &BrokerEndpoint,
    tls: TlsConfiguration,
    keep_alive: Duration,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
    mqtt_options.set_transport(RumqttcTransport::Tls(tls));
    mqtt_options.set_keep_alive(effective_keep_alive(keep_alive));
    // Commands and samples are small; keep the packet ceiling device sized
    mqtt_options.set_max_packet_size(Some(16 * 1024));
    mqtt_options
}
