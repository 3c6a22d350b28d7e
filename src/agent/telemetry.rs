//! Telemetry publisher: one sample per tick, dropped rather than queued

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::observability::LinkStats;
use crate::protocol::{MetricSample, MetricValue};
use crate::transport::{BrokerLink, MqttBackend};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one telemetry tick
#[derive(Debug)]
pub enum PublishOutcome {
    Published { size: usize },
    /// Sample dropped; link down or encoding failed
    Dropped { reason: AgentError },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

#[derive(Debug)]
pub struct TelemetryPublisher {
    topic: String,
    metric_name: String,
    include_timestamp: bool,
    max_payload_bytes: usize,
    stats: Arc<LinkStats>,
}

impl TelemetryPublisher {
    pub fn new(
        topic: impl Into<String>,
        metric_name: impl Into<String>,
        max_payload_bytes: usize,
        stats: Arc<LinkStats>,
    ) -> Self {
        Self {
            topic: topic.into(),
            metric_name: metric_name.into(),
            include_timestamp: false,
            max_payload_bytes,
            stats,
        }
    }

    pub fn from_config(config: &AgentConfig, stats: Arc<LinkStats>) -> Self {
        Self::new(
            config.publish_topic(),
            config.telemetry.metric_name.clone(),
            config.telemetry.max_payload_bytes,
            stats,
        )
        .with_timestamp(config.telemetry.include_timestamp)
    }

    pub fn with_timestamp(mut self, include_timestamp: bool) -> Self {
        self.include_timestamp = include_timestamp;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Build the sample for a value
    pub fn sample(&self, value: MetricValue) -> MetricSample {
        let sample = MetricSample::new(self.metric_name.clone(), value);
        if self.include_timestamp {
            sample.with_timestamp(Utc::now())
        } else {
            sample
        }
    }

    /// Encode and publish one sample; never blocks on a dead link
    pub fn tick<B: MqttBackend>(&self, link: &mut BrokerLink<B>, value: MetricValue) -> PublishOutcome {
        let _span = crate::telemetry_span!(topic = %self.topic, value = %value).entered();

        let payload = match self.sample(value).encode(self.max_payload_bytes) {
            Ok(payload) => payload,
            Err(e) => return self.drop_sample(e),
        };
        let size = payload.len();

        match link.publish(&self.topic, Bytes::from(payload)) {
            Ok(()) => {
                self.stats.record_sample_published();
                debug!(size, "Sample published");
                PublishOutcome::Published { size }
            }
            Err(e) => self.drop_sample(e),
        }
    }

    fn drop_sample(&self, reason: AgentError) -> PublishOutcome {
        self.stats.record_sample_dropped();
        match &reason {
            AgentError::NotConnected { .. } => {
                debug!(error = %reason, "Link down, sample dropped")
            }
            AgentError::Backpressure { .. } => {
                warn!(error = %reason, "Request queue full, sample dropped")
            }
            _ => warn!(error = %reason.log_message(), "Sample dropped"),
        }
        PublishOutcome::Dropped { reason }
    }
}
