//! Pure routing and classification of rumqttc events
//!
//! The rumqttc backend polls its event loop and hands every event and error to
//! the functions here; they decide what the event means for the link without
//! touching any I/O.

use crate::error::{AgentError, AgentResult};
use crate::protocol::InboundMessage;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, SubAck, SubscribeReasonCode};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{ClientError, ConnectionError, Event};
use std::time::Duration;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => match connack.code {
                    ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged {
                        server_keep_alive: connack
                            .properties
                            .as_ref()
                            .and_then(|props| props.server_keep_alive)
                            .map(|secs| Duration::from_secs(u64::from(secs))),
                    },
                    code => EventRoute::ConnectionRefused(code),
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    result: Self::validate_subscription_success(suback),
                },
                other => {
                    debug!(packet = ?other, "Link activity");
                    EventRoute::Activity
                }
            },
            Event::Outgoing(_) => EventRoute::Outgoing,
        }
    }

    /// Turn a received publish into an inbound message (pure function)
    pub fn to_inbound(topic: String, payload: Bytes) -> InboundMessage {
        InboundMessage { topic, payload }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(suback: &SubAck) -> AgentResult<()> {
        for code in &suback.return_codes {
            match code {
                SubscribeReasonCode::Success(_) => {}
                SubscribeReasonCode::NotAuthorized => {
                    return Err(AgentError::authentication(
                        "broker refused subscription: not authorized",
                    ))
                }
                other => {
                    return Err(AgentError::network(format!(
                        "broker refused subscription: {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Classify a refused CONNECT (pure function)
    pub fn classify_connect_refusal(code: ConnectReturnCode) -> AgentError {
        match code {
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
                AgentError::authentication(format!("broker refused connection: {code:?}"))
            }
            other => AgentError::network(format!("broker refused connection: {other:?}")),
        }
    }

    /// Classify an event loop error (pure function)
    ///
    /// TLS failures are treated as certificate rejection. rumqttc reports I/O
    /// errors raised during the TLS handshake through the same variant, so a
    /// reset mid-handshake is also reported as an authentication failure.
    pub fn classify_connection_error(error: &ConnectionError) -> AgentError {
        match error {
            ConnectionError::Tls(e) => {
                AgentError::authentication(format!("TLS handshake failed: {e}"))
            }
            ConnectionError::ConnectionRefused(code) => Self::classify_connect_refusal(*code),
            other => AgentError::network(other.to_string()),
        }
    }

    /// Classify a failed client request (pure function)
    ///
    /// The backend owns the event loop, so `TryRequest` only means the
    /// request channel is full.
    pub fn classify_client_error(error: &ClientError) -> AgentError {
        match error {
            ClientError::TryRequest(_) => {
                AgentError::backpressure("MQTT request queue full")
            }
            ClientError::Request(_) => AgentError::network("MQTT event loop gone"),
        }
    }

    /// QoS used for every publish and subscription (pure function)
    pub fn determine_qos_level() -> QoS {
        QoS::AtLeastOnce
    }
}

/// Routing decisions for MQTT events
#[derive(Debug)]
pub enum EventRoute {
    /// Broker accepted the CONNECT, possibly overriding the keepalive
    ConnectionAcknowledged { server_keep_alive: Option<Duration> },
    /// Broker refused the CONNECT
    ConnectionRefused(ConnectReturnCode),
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected,
    /// SubAck with per-filter outcome folded into one result
    SubscriptionAcknowledged {
        packet_id: u16,
        result: AgentResult<()>,
    },
    /// Any other inbound packet (PingResp, PubAck, ...)
    Activity,
    /// Outgoing event (handled automatically)
    Outgoing,
}
