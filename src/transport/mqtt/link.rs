//! Broker link: MQTT semantics on top of the transport session
//!
//! The link persists its subscription list across sessions and re-applies it
//! after every handshake before it reports itself connected.

use super::connection::{ConnectionState, ReconnectConfig};
use super::health_monitor::HealthMonitor;
use super::session::TransportSession;
use crate::config::Credentials;
use crate::error::{AgentError, AgentResult};
use crate::protocol::{validate_publish_topic, validate_topic_filter, InboundMessage};
use crate::transport::{BackendEvent, MqttBackend};
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct BrokerLink<B> {
    session: TransportSession<B>,
    /// Insertion ordered, deduplicated
    subscriptions: Vec<String>,
    connected: bool,
    last_activity: Option<Instant>,
    /// Keepalive in effect for the current session
    keep_alive: Duration,
    config: ReconnectConfig,
}

impl<B: MqttBackend> BrokerLink<B> {
    pub fn new(backend: B, config: ReconnectConfig) -> Self {
        Self {
            session: TransportSession::new(backend),
            subscriptions: Vec::new(),
            connected: false,
            last_activity: None,
            keep_alive: config.keep_alive,
            config,
        }
    }

    /// Open the transport session underneath the link
    pub async fn open_session(&mut self, credentials: &Credentials) -> AgentResult<()> {
        self.session
            .open(credentials, self.config.connect_timeout)
            .await
    }

    /// Run the MQTT handshake and re-apply every subscription
    ///
    /// Any failure closes the session so the next attempt starts clean.
    pub async fn connect(&mut self, client_id: &str) -> AgentResult<()> {
        if !self.session.is_open() {
            return Err(AgentError::not_connected(ConnectionState::Disconnected));
        }
        self.connected = false;

        if let Err(e) = self.handshake_and_resubscribe(client_id).await {
            self.teardown().await;
            return Err(e);
        }

        self.connected = true;
        self.last_activity = Some(Instant::now());
        info!(
            client_id = %client_id,
            subscriptions = self.subscriptions.len(),
            "Broker link connected"
        );
        Ok(())
    }

    async fn handshake_and_resubscribe(&mut self, client_id: &str) -> AgentResult<()> {
        let timeout = self.config.connect_timeout;
        let negotiated = self
            .session
            .backend_mut()
            .handshake(client_id, self.config.keep_alive, timeout)
            .await?;
        if negotiated != self.config.keep_alive {
            info!(
                requested_secs = self.config.keep_alive.as_secs(),
                negotiated_secs = negotiated.as_secs(),
                "Broker overrode keepalive"
            );
        }
        self.keep_alive = negotiated;

        for filter in &self.subscriptions {
            debug!(filter = %filter, "Re-applying subscription");
            self.session
                .backend_mut()
                .subscribe(filter, timeout)
                .await?;
        }
        Ok(())
    }

    /// Subscribe to a filter; deferred to the next connect while down
    pub async fn subscribe(&mut self, filter: &str) -> AgentResult<()> {
        validate_topic_filter(filter)?;

        if self.subscriptions.iter().any(|s| s == filter) {
            return Ok(());
        }

        if self.connected {
            let timeout = self.config.connect_timeout;
            if let Err(e) = self.session.backend_mut().subscribe(filter, timeout).await {
                // Not recorded: a refused filter would fail every later connect
                warn!(filter = %filter, error = %e.log_message(), "Subscription failed");
                return Err(e);
            }
            info!(filter = %filter, "Subscribed");
        } else {
            debug!(filter = %filter, "Link down, subscription deferred to next connect");
        }

        self.subscriptions.push(filter.to_string());
        Ok(())
    }

    /// Publish without buffering; fails immediately while down
    pub fn publish(&mut self, topic: &str, payload: Bytes) -> AgentResult<()> {
        validate_publish_topic(topic)?;

        if !self.connected {
            return Err(AgentError::not_connected(self.link_state()));
        }

        match self.session.backend_mut().publish(topic, payload) {
            Ok(()) => Ok(()),
            // Queue full; the session itself is healthy
            Err(e @ AgentError::Backpressure { .. }) => Err(e),
            Err(e) => {
                // The session is closed by the next poll or supervisor step
                self.connected = false;
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for an inbound message
    pub async fn poll(&mut self, timeout: Duration) -> AgentResult<Option<InboundMessage>> {
        if !self.connected {
            self.teardown().await;
            return Err(AgentError::not_connected(self.link_state()));
        }

        match self.session.backend_mut().poll(timeout).await {
            Ok(Some(BackendEvent::Message(message))) => {
                self.last_activity = Some(Instant::now());
                Ok(Some(message))
            }
            Ok(Some(BackendEvent::Activity)) => {
                self.last_activity = Some(Instant::now());
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// True once nothing has arrived for 1.5x the negotiated keepalive
    pub fn keepalive_expired(&self, now: Instant) -> bool {
        match (self.connected, self.last_activity) {
            (true, Some(last)) => HealthMonitor::keepalive_expired(last, now, self.keep_alive),
            _ => false,
        }
    }

    /// Close the session and mark the link down
    pub async fn disconnect(&mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.connected = false;
        self.session.close().await;
    }

    fn link_state(&self) -> ConnectionState {
        if self.session.is_open() {
            ConnectionState::BrokerConnecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.session.is_open()
    }

    /// Keepalive negotiated by the last handshake
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn session(&self) -> &TransportSession<B> {
        &self.session
    }
}
