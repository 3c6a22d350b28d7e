//! Metric sources feeding the telemetry publisher

use crate::config::SourceConfig;
use crate::error::{AgentError, AgentResult};
use crate::protocol::MetricValue;
use std::path::PathBuf;

/// Produces one reading per telemetry tick
#[async_trait::async_trait]
pub trait MetricSource: Send {
    async fn read(&mut self) -> AgentResult<MetricValue>;
}

/// Always reports the same value
#[derive(Debug, Clone, Copy)]
pub struct ConstantSource {
    value: MetricValue,
}

impl ConstantSource {
    pub fn new(value: impl Into<MetricValue>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait::async_trait]
impl MetricSource for ConstantSource {
    async fn read(&mut self) -> AgentResult<MetricValue> {
        Ok(self.value)
    }
}

/// Reads a number from a file such as a sysfs sensor node
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    scale: f64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, scale: f64) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }

    /// Integers stay integral under a unit scale
    fn parse(&self, text: &str) -> AgentResult<MetricValue> {
        let text = text.trim();
        if self.scale == 1.0 {
            if let Ok(value) = text.parse::<i64>() {
                return Ok(MetricValue::Integer(value));
            }
        }

        let value: f64 = text.parse().map_err(|_| {
            AgentError::source(format!(
                "{} does not contain a number: {text:?}",
                self.path.display()
            ))
        })?;
        let scaled = value * self.scale;
        if !scaled.is_finite() {
            return Err(AgentError::source(format!(
                "{} produced a non-finite reading",
                self.path.display()
            )));
        }
        Ok(MetricValue::Float(scaled))
    }
}

#[async_trait::async_trait]
impl MetricSource for FileSource {
    async fn read(&mut self) -> AgentResult<MetricValue> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AgentError::source(format!("reading {}: {e}", self.path.display())))?;
        self.parse(&text)
    }
}

/// Build the source named in configuration
pub fn source_from_config(config: &SourceConfig) -> Box<dyn MetricSource> {
    match config {
        SourceConfig::Constant { value } => Box::new(ConstantSource::new(*value)),
        SourceConfig::File { path, scale } => Box::new(FileSource::new(path.clone(), *scale)),
    }
}
