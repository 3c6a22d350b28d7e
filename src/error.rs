//! Error taxonomy for the telemetry agent
//!
//! Every failure in the link layer degrades to "stay disconnected and keep
//! retrying"; only configuration errors at startup terminate the process.
//! Messages that reach the logs go through [`sanitize_error_message`] so that
//! secrets and key material never leak.

use crate::config::ConfigError;
use crate::transport::mqtt::ConnectionState;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// Network or transport unreachable, timed out, or dropped
    #[error("Network error: {message}")]
    Network { message: String },

    /// Certificates or credentials rejected by the peer
    #[error("Authentication error: {message}")]
    Authentication { message: String },

    /// Publish or subscribe attempted while the link is down
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    /// Inbound payload could not be decoded into a command
    #[error("Malformed payload on '{topic}': {reason}")]
    MalformedPayload { topic: String, reason: String },

    /// Outbound payload could not be encoded within its bound
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// Request queue to the MQTT event loop is momentarily full
    #[error("Backpressure: {message}")]
    Backpressure { message: String },

    #[error("Transport session already open")]
    SessionAlreadyOpen,

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Metric source error: {message}")]
    Source { message: String },

    #[error("Command handler error: {message}")]
    Handler { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AgentError {
    /// Create network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create authentication error
    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn not_connected(state: ConnectionState) -> Self {
        Self::NotConnected { state }
    }

    /// Create malformed payload error
    pub fn malformed_payload<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::MalformedPayload {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Create encoding error
    pub fn encoding<S: Into<String>>(message: S) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Create encoding error for a payload that outgrew its bound
    pub fn payload_too_large(limit: usize) -> Self {
        Self::encoding(format!("payload exceeds limit of {limit} bytes"))
    }

    pub fn backpressure<S: Into<String>>(message: S) -> Self {
        Self::Backpressure {
            message: message.into(),
        }
    }

    pub fn invalid_topic<T: Into<String>, R: Into<String>>(topic: T, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn source<S: Into<String>>(message: S) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Whether the supervisor should keep retrying after this error
    ///
    /// Authentication failures are retried too, but escalated separately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Network { .. }
                | AgentError::Authentication { .. }
                | AgentError::NotConnected { .. }
                | AgentError::Backpressure { .. }
                | AgentError::SessionAlreadyOpen
        )
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, AgentError::Authentication { .. })
    }

    /// Error text safe to write to logs
    pub fn log_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

static PEM_BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-----BEGIN [A-Z ]+-----[\s\S]*?-----END [A-Z ]+-----")
        .expect("valid PEM pattern")
});

const MAX_LOG_MESSAGE_LEN: usize = 500;

/// Sanitize error messages to prevent credential leakage into logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = PEM_BLOCK_PATTERN
        .replace_all(message, "[PEM REDACTED]")
        .to_string();

    sanitized = SECRET_PATTERN
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_LOG_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOG_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
