//! Reconnection supervisor
//!
//! Owns the one [`ConnectionState`] of the agent together with the broker link
//! and the network driver. Each [`ReconnectionSupervisor::step`] either runs a
//! complete, time-bounded connection attempt, or services the live link for at
//! most one poll interval. Decisions come from the pure [`HealthMonitor`].

use crate::config::Credentials;
use crate::error::{AgentError, AgentResult};
use crate::observability::LinkStats;
use crate::protocol::InboundMessage;
use crate::transport::mqtt::{
    BrokerLink, ConnectionEvent, ConnectionState, HealthMetrics, HealthMonitor, ReconnectConfig,
    ReconnectionDecision,
};
use crate::transport::{MqttBackend, NetworkDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn, Instrument};

pub struct ReconnectionSupervisor<B, N> {
    state: ConnectionState,
    link: BrokerLink<B>,
    network: N,
    credentials: Arc<Credentials>,
    config: ReconnectConfig,
    consecutive_failures: u32,
    consecutive_auth_failures: u32,
    next_attempt_at: Option<Instant>,
    current_delay: Option<Duration>,
    connected_since: Option<Instant>,
    stats: Arc<LinkStats>,
}

impl<B: MqttBackend, N: NetworkDriver> ReconnectionSupervisor<B, N> {
    pub fn new(
        backend: B,
        network: N,
        credentials: Arc<Credentials>,
        config: ReconnectConfig,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            link: BrokerLink::new(backend, config.clone()),
            network,
            credentials,
            config,
            consecutive_failures: 0,
            consecutive_auth_failures: 0,
            next_attempt_at: None,
            current_delay: None,
            connected_since: None,
            stats,
        }
    }

    /// Advance the state machine by one step
    ///
    /// Returns an inbound message when the live link produced one.
    pub async fn step(&mut self, now: Instant, budget: Duration) -> Option<InboundMessage> {
        match HealthMonitor::should_attempt_reconnection(self.state, self.next_attempt_at, now) {
            ReconnectionDecision::Proceed => {
                let span = crate::link_span!(
                    client_id = %self.credentials.client_id,
                    endpoint = %self.credentials.endpoint
                );
                self.attempt().instrument(span).await;
                return None;
            }
            ReconnectionDecision::Wait { remaining } => {
                debug!(state = %self.state, remaining_ms = remaining.as_millis() as u64, "Waiting for backoff");
                return None;
            }
            ReconnectionDecision::NotIdle => {}
        }

        if self.state != ConnectionState::BrokerConnected {
            return None;
        }

        if let Some(since) = self.connected_since {
            if self.consecutive_failures > 0
                && HealthMonitor::should_reset_backoff(now.saturating_duration_since(since), &self.config)
            {
                debug!("Connection stable, backoff reset");
                self.consecutive_failures = 0;
            }
        }

        if !self.network.is_associated() {
            self.link_lost("network association lost").await;
            return None;
        }
        if !self.link.is_connected() {
            self.link_lost("transport closed").await;
            return None;
        }
        if self.link.keepalive_expired(now) {
            self.link_lost("keepalive expired").await;
            return None;
        }

        match self.link.poll(budget).await {
            Ok(message) => message,
            Err(e) => {
                self.link_lost(&e.log_message()).await;
                None
            }
        }
    }

    /// One full attempt: associate, open session, handshake, re-subscribe
    async fn attempt(&mut self) {
        self.transition(ConnectionEvent::AttemptStarted);
        self.stats.record_connection_attempt();

        if let Err(e) = self.associate().await {
            self.attempt_failed(e).await;
            return;
        }
        self.transition(ConnectionEvent::NetworkAssociated);

        self.transition(ConnectionEvent::BrokerHandshakeStarted);
        if let Err(e) = self.connect_broker().await {
            self.attempt_failed(e).await;
            return;
        }

        self.transition(ConnectionEvent::BrokerReady);
        self.stats.record_connection_established();
        self.connected_since = Some(Instant::now());
        self.consecutive_auth_failures = 0;
        self.next_attempt_at = None;
        self.current_delay = None;
    }

    async fn associate(&mut self) -> AgentResult<()> {
        if self.network.is_associated() {
            return Ok(());
        }
        let ssid = self.credentials.ssid.as_str();
        let secret = self.credentials.network_secret.as_str();
        match timeout(self.config.network_timeout, self.network.associate(ssid, secret)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::network(format!(
                "network association timed out after {:?}",
                self.config.network_timeout
            ))),
        }
    }

    async fn connect_broker(&mut self) -> AgentResult<()> {
        // A session left over from an aborted attempt is torn down first
        self.link.disconnect().await;
        self.link.open_session(&self.credentials).await?;
        self.link.connect(&self.credentials.client_id).await
    }

    async fn attempt_failed(&mut self, error: AgentError) {
        self.link.disconnect().await;

        if error.is_authentication() {
            self.consecutive_auth_failures += 1;
            self.stats.record_auth_failure();
            self.transition(ConnectionEvent::AuthenticationRejected(error.log_message()));

            if HealthMonitor::should_escalate(self.consecutive_auth_failures, &self.config) {
                error!(
                    consecutive_failures = self.consecutive_auth_failures,
                    "Broker keeps rejecting credentials; check certificates and policy"
                );
            }
        } else {
            self.transition(ConnectionEvent::AttemptFailed(error.log_message()));
        }

        self.schedule_retry();
    }

    async fn link_lost(&mut self, reason: &str) {
        self.link.disconnect().await;
        self.stats.record_link_drop();

        if let Some(since) = self.connected_since.take() {
            if HealthMonitor::should_reset_backoff(since.elapsed(), &self.config) {
                self.consecutive_failures = 0;
            }
        }

        self.transition(ConnectionEvent::LinkLost(reason.to_string()));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = HealthMonitor::backoff_delay(self.consecutive_failures, &self.config);
        self.current_delay = Some(delay);
        self.next_attempt_at = Some(Instant::now() + delay);
        info!(
            attempt = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(self.state, &event);
        HealthMonitor::log_state_transition(self.state, next, &event);
        self.state = next;
    }

    /// Close the link gracefully and stay down
    pub async fn shutdown(&mut self) {
        if self.state == ConnectionState::BrokerConnected {
            info!("Closing broker link");
        }
        self.link.disconnect().await;
        self.connected_since = None;
        self.transition(ConnectionEvent::Shutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// When the next attempt may start; `None` means immediately
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// Delay chosen for the pending retry, if one is pending
    pub fn current_delay(&self) -> Option<Duration> {
        self.current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn health(&self, now: Instant) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            self.state,
            self.connected_since,
            self.link.last_activity(),
            self.consecutive_failures,
            now,
        )
    }

    pub fn link(&self) -> &BrokerLink<B> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut BrokerLink<B> {
        &mut self.link
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

impl<B, N> Drop for ReconnectionSupervisor<B, N> {
    fn drop(&mut self) {
        if self.state == ConnectionState::BrokerConnected {
            warn!("Supervisor dropped with a live link; call shutdown() for a clean DISCONNECT");
        }
    }
}
