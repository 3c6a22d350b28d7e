//! Configuration system for the telemetry agent
//!
//! Configuration is read once at startup from a TOML file. Secrets never live
//! in the file itself: the network passphrase is named by an environment
//! variable and the TLS material by file paths. Everything is immutable after
//! [`Credentials::load`] has produced the credential bundle.

use crate::transport::mqtt::connection::{MAX_KEEP_ALIVE, MIN_KEEP_ALIVE};
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default port for MQTT over TLS
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Main agent configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub device: DeviceSection,
    pub network: NetworkSection,
    pub broker: BrokerSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub commands: CommandsSection,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// MQTT client identifier (must match [a-zA-Z0-9:_-]+)
    pub client_id: String,
}

/// Network association settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// Network name to associate with
    pub ssid: String,
    /// Environment variable containing the network passphrase
    pub password_env: Option<String>,
    /// Association timeout in seconds
    #[serde(default = "default_network_timeout")]
    pub timeout_secs: u64,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, e.g. `mqtts://example-ats.iot.eu-west-1.amazonaws.com`
    pub url: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound for a single link poll in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Paths to PEM encoded trust material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Topic overrides; defaults derive from the client id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    pub publish: Option<String>,
    pub subscribe: Option<String>,
}

/// Periodic telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
    #[serde(default)]
    pub include_timestamp: bool,
    /// Upper bound for an encoded sample
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval(),
            metric_name: default_metric_name(),
            include_timestamp: false,
            max_payload_bytes: default_max_payload_bytes(),
            source: SourceConfig::default(),
        }
    }
}

/// Where telemetry values come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Publish the same value on every tick
    Constant { value: crate::protocol::MetricValue },
    /// Read a number from a file (e.g. a sysfs sensor node) and scale it
    File {
        path: PathBuf,
        #[serde(default = "default_scale")]
        scale: f64,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Constant {
            value: crate::protocol::MetricValue::Integer(0),
        }
    }
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Connected time after which the backoff resets to its base
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
    /// Consecutive authentication failures before operator escalation
    #[serde(default = "default_auth_failure_escalation")]
    pub auth_failure_escalation: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            reset_after_secs: default_reset_after(),
            auth_failure_escalation: default_auth_failure_escalation(),
        }
    }
}

/// Commands accepted on the subscribe topic
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandsSection {
    #[serde(default)]
    pub names: Vec<String>,
}

fn default_network_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

fn default_telemetry_interval() -> u64 {
    5
}

fn default_metric_name() -> String {
    "metrics".to_string()
}

fn default_max_payload_bytes() -> usize {
    256
}

fn default_scale() -> f64 {
    1.0
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_reset_after() -> u64 {
    60
}

fn default_auth_failure_escalation() -> u32 {
    3
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Failed to read TLS material {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.device.client_id)?;
        self.broker_endpoint()?;

        if self.network.ssid.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "network.ssid must not be empty".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms".to_string(),
            ));
        }
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.max_payload_bytes must be greater than 0".to_string(),
            ));
        }
        let keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        if keep_alive < MIN_KEEP_ALIVE || keep_alive > MAX_KEEP_ALIVE {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.keep_alive_secs must be between {} and {}",
                MIN_KEEP_ALIVE.as_secs(),
                MAX_KEEP_ALIVE.as_secs()
            )));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.network.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "network.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        let publish = self.publish_topic();
        crate::protocol::validate_publish_topic(&publish)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        let subscribe = self.subscribe_topic();
        crate::protocol::validate_topic_filter(&subscribe)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        Ok(())
    }

    /// Parse the broker URL into host and port
    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        let url = Url::parse(&self.broker.url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?;

        if !matches!(url.scheme(), "mqtts" | "ssl") {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{} (scheme must be mqtts:// or ssl://)",
                self.broker.url
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker.url.clone()))?;

        Ok(BrokerEndpoint {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_TLS_PORT),
        })
    }

    pub fn publish_topic(&self) -> String {
        self.topics
            .publish
            .clone()
            .unwrap_or_else(|| format!("esp32/{}/status", self.device.client_id))
    }

    pub fn subscribe_topic(&self) -> String {
        self.topics
            .subscribe
            .clone()
            .unwrap_or_else(|| format!("esp32/{}/commands", self.device.client_id))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.broker.connect_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.broker.poll_interval_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    /// Backoff and timeout settings for the reconnection supervisor
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            reset_after: Duration::from_secs(self.reconnect.reset_after_secs),
            network_timeout: self.network_timeout(),
            connect_timeout: self.connect_timeout(),
            keep_alive: self.keep_alive(),
            auth_failure_escalation: self.reconnect.auth_failure_escalation,
        }
    }

    /// Helper method to get environment variable with error propagation
    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Get the network passphrase from its environment variable
    ///
    /// Open networks have no `password_env` and get an empty passphrase.
    pub fn get_network_secret(&self) -> Result<String, ConfigError> {
        match &self.network.password_env {
            Some(name) => Self::get_env_var_required(name),
            None => Ok(String::new()),
        }
    }
}

/// Validate client identifier format (AWS IoT thing names use the same set)
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-');

    if client_id.is_empty() || client_id.len() > 128 || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9:_-]{{1,128}}"
        )));
    }

    Ok(())
}

/// Broker host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable credential bundle, loaded once at startup
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub network_secret: String,
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub endpoint: BrokerEndpoint,
    pub client_id: String,
}

impl Credentials {
    /// Resolve the credential bundle from configuration, reading TLS
    /// material from disk and the network secret from the environment
    pub fn load(config: &AgentConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            ssid: config.network.ssid.clone(),
            network_secret: config.get_network_secret()?,
            ca_cert: read_tls_material(&config.tls.ca_path)?,
            client_cert: read_tls_material(&config.tls.cert_path)?,
            client_key: read_tls_material(&config.tls.key_path)?,
            endpoint: config.broker_endpoint()?,
            client_id: config.device.client_id.clone(),
        })
    }
}

fn read_tls_material(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("network_secret", &"***")
            .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"***")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[cfg(test)]
impl AgentConfig {
    /// Create a test configuration for unit testing
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
client_id = "SmartParkingESP32"

[network]
ssid = "test-network"

[broker]
url = "mqtts://broker.example.com"

[tls]
ca_path = "certs/ca.pem"
cert_path = "certs/device.pem.crt"
key_path = "certs/private.pem.key"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
