//! Pure health monitoring and reconnection logic
//!
//! State transitions, backoff decisions and keepalive checks live here as pure
//! functions; the supervisor feeds them events and applies the results.

use super::connection::{keepalive_deadline, ConnectionState, ReconnectConfig};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

/// Events that drive [`ConnectionState`] transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Backoff cooldown elapsed, network association started
    AttemptStarted,
    /// Network driver reports association
    NetworkAssociated,
    /// Transport session opening and MQTT handshake started
    BrokerHandshakeStarted,
    /// Handshake done and every subscription re-applied
    BrokerReady,
    /// Peer rejected certificates or credentials
    AuthenticationRejected(String),
    /// Attempt failed on network grounds (unreachable, timeout, refused)
    AttemptFailed(String),
    /// Live link lost (transport error, keepalive miss, association loss)
    LinkLost(String),
    /// Graceful local shutdown
    Shutdown,
}

/// Decision for an idle supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Cooldown elapsed, start an attempt now
    Proceed,
    /// Cooldown still running
    Wait { remaining: Duration },
    /// Nothing to do, the link is up or an attempt is running
    NotIdle,
}

impl HealthMonitor {
    /// Determine next state after a connection event (pure function)
    ///
    /// Events that make no sense in the current state leave it unchanged.
    pub fn determine_next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
    ) -> ConnectionState {
        use ConnectionState::*;

        match (current, event) {
            (_, ConnectionEvent::Shutdown) => Disconnected,
            (Disconnected | Failed, ConnectionEvent::AttemptStarted) => WiFiConnecting,
            (WiFiConnecting, ConnectionEvent::NetworkAssociated) => WiFiConnected,
            (WiFiConnected, ConnectionEvent::BrokerHandshakeStarted) => BrokerConnecting,
            (BrokerConnecting, ConnectionEvent::BrokerReady) => BrokerConnected,
            (
                WiFiConnecting | WiFiConnected | BrokerConnecting,
                ConnectionEvent::AuthenticationRejected(_),
            ) => Failed,
            (
                WiFiConnecting | WiFiConnected | BrokerConnecting,
                ConnectionEvent::AttemptFailed(_),
            ) => Disconnected,
            (
                WiFiConnected | BrokerConnecting | BrokerConnected,
                ConnectionEvent::LinkLost(_),
            ) => Disconnected,
            (state, _) => state,
        }
    }

    /// Decide whether an idle supervisor should start an attempt (pure function)
    pub fn should_attempt_reconnection(
        state: ConnectionState,
        next_attempt_at: Option<Instant>,
        now: Instant,
    ) -> ReconnectionDecision {
        if !state.is_idle() {
            return ReconnectionDecision::NotIdle;
        }

        match next_attempt_at {
            Some(at) if at > now => ReconnectionDecision::Wait {
                remaining: at - now,
            },
            _ => ReconnectionDecision::Proceed,
        }
    }

    /// Delay before the next attempt given the consecutive failure count
    /// including the one that just happened (pure function)
    pub fn backoff_delay(consecutive_failures: u32, config: &ReconnectConfig) -> Duration {
        config.calculate_backoff_delay(consecutive_failures.max(1))
    }

    /// Whether a connection has been up long enough to forget earlier
    /// failures (pure function)
    pub fn should_reset_backoff(connected_for: Duration, config: &ReconnectConfig) -> bool {
        connected_for >= config.reset_after
    }

    /// Whether a link negotiated at `keep_alive` has been silent past its
    /// deadline (pure function)
    pub fn keepalive_expired(last_activity: Instant, now: Instant, keep_alive: Duration) -> bool {
        now.saturating_duration_since(last_activity) >= keepalive_deadline(keep_alive)
    }

    /// Whether auth failures have piled up to the escalation threshold (pure function)
    pub fn should_escalate(consecutive_auth_failures: u32, config: &ReconnectConfig) -> bool {
        config.auth_failure_escalation > 0
            && consecutive_auth_failures >= config.auth_failure_escalation
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::BrokerConnected)
    }

    /// Snapshot link health (pure function)
    pub fn calculate_health_metrics(
        state: ConnectionState,
        connected_since: Option<Instant>,
        last_activity: Option<Instant>,
        consecutive_failures: u32,
        now: Instant,
    ) -> HealthMetrics {
        let uptime = connected_since.map(|t| now.saturating_duration_since(t));
        let time_since_activity = last_activity.map(|t| now.saturating_duration_since(t));

        HealthMetrics {
            state,
            uptime,
            time_since_activity,
            consecutive_failures,
            is_healthy: Self::can_publish(state) && uptime.is_some(),
        }
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(
        from: ConnectionState,
        to: ConnectionState,
        event: &ConnectionEvent,
    ) {
        if from == to {
            return;
        }

        match (to, event) {
            (ConnectionState::BrokerConnected, _) => {
                info!(from = %from, to = %to, "Broker link established");
            }
            (ConnectionState::Failed, ConnectionEvent::AuthenticationRejected(reason)) => {
                error!(from = %from, to = %to, reason = %reason, "Broker rejected credentials");
            }
            (ConnectionState::Disconnected, ConnectionEvent::LinkLost(reason)) => {
                warn!(from = %from, to = %to, reason = %reason, "Broker link lost");
            }
            (ConnectionState::Disconnected, ConnectionEvent::AttemptFailed(reason)) => {
                warn!(from = %from, to = %to, reason = %reason, "Connection attempt failed");
            }
            _ => {
                info!(from = %from, to = %to, "Connection state changed");
            }
        }
    }
}

/// Health snapshot for the broker link
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub state: ConnectionState,
    /// Time since the link last reached BrokerConnected
    pub uptime: Option<Duration>,
    /// Time since the last inbound packet
    pub time_since_activity: Option<Duration>,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
}
