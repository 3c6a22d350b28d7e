//! rumqttc backend for the transport session and broker link
//!
//! rumqttc runs TLS and MQTT in one event loop, so `open` only resolves the
//! endpoint and stages the rustls configuration; the TLS handshake happens as
//! part of `handshake`. A fresh client and event loop are built for every
//! handshake so that no state survives a dropped session.

use super::connection::{configure_mqtt_options, effective_keep_alive};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::BrokerEndpoint;
use crate::error::{AgentError, AgentResult};
use crate::protocol::InboundMessage;
use crate::transport::{BackendEvent, MqttBackend, TrustMaterial};
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use rumqttc::TlsConfiguration;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Grace period for flushing DISCONNECT on close
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// rumqttc (MQTT v5 over rustls) implementation of [`MqttBackend`]
#[derive(Default)]
pub struct RumqttcBackend {
    endpoint: Option<BrokerEndpoint>,
    tls: Option<TlsConfiguration>,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    /// Publishes that arrived while waiting for a SubAck
    pending: VecDeque<InboundMessage>,
}

impl RumqttcBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn event_loop(&mut self) -> AgentResult<&mut EventLoop> {
        self.event_loop
            .as_mut()
            .ok_or_else(|| AgentError::network("no MQTT session"))
    }

    /// Drive the event loop until `done` accepts a route, buffering any
    /// publishes seen on the way
    async fn poll_until<F>(&mut self, deadline: Duration, what: &str, mut done: F) -> AgentResult<()>
    where
        F: FnMut(EventRoute) -> Option<AgentResult<()>>,
    {
        let event_loop = self
            .event_loop
            .as_mut()
            .ok_or_else(|| AgentError::network("no MQTT session"))?;
        let pending = &mut self.pending;

        let waited = timeout(deadline, async {
            loop {
                let event = event_loop
                    .poll()
                    .await
                    .map_err(|e| MessageHandler::classify_connection_error(&e))?;

                match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::MessageReceived { topic, payload, retain } => {
                        if !retain {
                            pending.push_back(MessageHandler::to_inbound(topic, payload));
                        }
                    }
                    EventRoute::Disconnected => {
                        return Err(AgentError::network("broker sent DISCONNECT"));
                    }
                    route => {
                        if let Some(result) = done(route) {
                            return result;
                        }
                    }
                }
            }
        })
        .await;

        waited.unwrap_or_else(|_| Err(AgentError::network(format!("{what} timed out"))))
    }
}

#[async_trait::async_trait]
impl MqttBackend for RumqttcBackend {
    async fn open(
        &mut self,
        endpoint: &BrokerEndpoint,
        trust: &TrustMaterial,
        deadline: Duration,
    ) -> AgentResult<()> {
        let lookup = timeout(
            deadline,
            tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| AgentError::network(format!("resolving {endpoint} timed out")))?
        .map_err(|e| AgentError::network(format!("resolving {endpoint}: {e}")))?;

        let addresses = lookup.count();
        if addresses == 0 {
            return Err(AgentError::network(format!("{endpoint} has no addresses")));
        }
        debug!(endpoint = %endpoint, addresses, "Broker endpoint resolved");

        self.endpoint = Some(endpoint.clone());
        self.tls = Some(trust.to_tls_configuration());
        Ok(())
    }

    async fn handshake(
        &mut self,
        client_id: &str,
        keep_alive: Duration,
        deadline: Duration,
    ) -> AgentResult<Duration> {
        let (Some(endpoint), Some(tls)) = (self.endpoint.as_ref(), self.tls.clone()) else {
            return Err(AgentError::network("transport session not open"));
        };

        let options = configure_mqtt_options(client_id, endpoint, tls, keep_alive);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        self.pending.clear();

        let mut negotiated = effective_keep_alive(keep_alive);
        self.poll_until(deadline, "MQTT handshake", |route| match route {
            EventRoute::ConnectionAcknowledged { server_keep_alive } => {
                if let Some(server) = server_keep_alive {
                    negotiated = server;
                }
                Some(Ok(()))
            }
            EventRoute::ConnectionRefused(code) => {
                Some(Err(MessageHandler::classify_connect_refusal(code)))
            }
            _ => None,
        })
        .await?;
        Ok(negotiated)
    }

    async fn subscribe(&mut self, filter: &str, deadline: Duration) -> AgentResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AgentError::network("no MQTT session"))?;
        client
            .try_subscribe(filter, MessageHandler::determine_qos_level())
            .map_err(|e| AgentError::network(format!("subscribe request failed: {e}")))?;

        self.poll_until(deadline, "subscription", |route| match route {
            EventRoute::SubscriptionAcknowledged { result, .. } => Some(result),
            _ => None,
        })
        .await
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> AgentResult<()> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AgentError::network("no MQTT session"))?;
        client
            .try_publish(topic, MessageHandler::determine_qos_level(), false, payload)
            .map_err(|e| MessageHandler::classify_client_error(&e))
    }

    async fn poll(&mut self, deadline: Duration) -> AgentResult<Option<BackendEvent>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(BackendEvent::Message(message)));
        }

        let event = match timeout(deadline, self.event_loop()?.poll()).await {
            Err(_) => return Ok(None),
            Ok(result) => result.map_err(|e| MessageHandler::classify_connection_error(&e))?,
        };

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived { topic, payload, retain } => {
                if retain {
                    debug!(topic = %topic, "Ignoring retained message");
                    return Ok(Some(BackendEvent::Activity));
                }
                Ok(Some(BackendEvent::Message(MessageHandler::to_inbound(
                    topic, payload,
                ))))
            }
            EventRoute::Disconnected => Err(AgentError::network("broker sent DISCONNECT")),
            EventRoute::ConnectionRefused(code) => Err(MessageHandler::classify_connect_refusal(code)),
            EventRoute::SubscriptionAcknowledged { result: Err(e), .. } => {
                warn!(error = %e.log_message(), "Late subscription refusal");
                Ok(Some(BackendEvent::Activity))
            }
            EventRoute::Outgoing => Ok(None),
            _ => Ok(Some(BackendEvent::Activity)),
        }
    }

    async fn close(&mut self) {
        if let (Some(client), Some(event_loop)) = (self.client.take(), self.event_loop.as_mut()) {
            if client.try_disconnect().is_ok() {
                // Flush the DISCONNECT; the loop errors out once it is sent
                let _ = timeout(CLOSE_GRACE, async {
                    while event_loop.poll().await.is_ok() {}
                })
                .await;
            }
        }
        self.event_loop = None;
        self.pending.clear();
    }
}
