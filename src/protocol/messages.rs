//! Wire messages exchanged with the broker
//!
//! Inbound: a JSON object carrying at least a `message` string naming the
//! command. Outbound: a JSON object carrying the metric value under the metric
//! name (`metrics` by default), optionally stamped with an RFC 3339 timestamp.

use crate::error::{AgentError, AgentResult};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io;

/// Field carrying the command name in inbound payloads
pub const COMMAND_FIELD: &str = "message";

/// Field carrying the sample timestamp in outbound payloads
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Raw message as received from the broker link
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Decoded inbound command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    /// Every top-level field other than `message`
    pub arguments: Map<String, Value>,
}

impl Command {
    /// Decode a command from an inbound payload
    ///
    /// Fails with `MalformedPayload` when the bytes are not a JSON object or
    /// the object has no string `message` field.
    pub fn decode(topic: &str, payload: &[u8]) -> AgentResult<Self> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| AgentError::malformed_payload(topic, format!("invalid JSON: {e}")))?;

        let Value::Object(mut fields) = value else {
            return Err(AgentError::malformed_payload(
                topic,
                "payload is not a JSON object",
            ));
        };

        let name = match fields.remove(COMMAND_FIELD) {
            Some(Value::String(name)) if !name.is_empty() => name,
            Some(Value::String(_)) => {
                return Err(AgentError::malformed_payload(
                    topic,
                    "`message` field is empty",
                ))
            }
            Some(_) => {
                return Err(AgentError::malformed_payload(
                    topic,
                    "`message` field is not a string",
                ))
            }
            None => {
                return Err(AgentError::malformed_payload(
                    topic,
                    "missing `message` field",
                ))
            }
        };

        Ok(Self {
            name,
            arguments: fields,
        })
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

/// Numeric metric value, kept integral when the source is integral
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl MetricValue {
    fn to_json(self) -> AgentResult<Value> {
        match self {
            MetricValue::Integer(v) => Ok(Value::from(v)),
            MetricValue::Float(v) => serde_json::Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| AgentError::encoding(format!("metric value {v} is not finite"))),
        }
    }
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: MetricValue,
    pub timestamp: Option<DateTime<Utc>>,
}

impl MetricSample {
    pub fn new<S: Into<String>>(name: S, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn to_json(&self) -> AgentResult<Value> {
        let mut object = Map::new();
        object.insert(self.name.clone(), self.value.to_json()?);
        if let Some(timestamp) = self.timestamp {
            object.insert(
                TIMESTAMP_FIELD.to_string(),
                Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        Ok(Value::Object(object))
    }

    /// Encode the sample, failing instead of truncating when the encoded
    /// form would outgrow `limit` bytes
    pub fn encode(&self, limit: usize) -> AgentResult<Vec<u8>> {
        let document = self.to_json()?;
        let mut writer = BoundedWriter::new(limit);
        match serde_json::to_writer(&mut writer, &document) {
            Ok(()) => Ok(writer.into_inner()),
            Err(_) if writer.overflowed => Err(AgentError::payload_too_large(limit)),
            Err(e) => Err(AgentError::encoding(e.to_string())),
        }
    }
}

/// `io::Write` sink that refuses to grow past a fixed bound
struct BoundedWriter {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

impl BoundedWriter {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(1024)),
            limit,
            overflowed: false,
        }
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl io::Write for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.limit {
            self.overflowed = true;
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "encoded payload exceeds bound",
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
