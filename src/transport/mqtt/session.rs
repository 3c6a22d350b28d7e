//! Transport session: the single encrypted connection to the broker

use crate::config::Credentials;
use crate::error::{AgentError, AgentResult};
use crate::transport::MqttBackend;
use rumqttc::TlsConfiguration;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const PEM_MARKER: &[u8] = b"-----BEGIN ";

/// CA certificate plus client certificate and key, all PEM encoded
#[derive(Clone, PartialEq, Eq)]
pub struct TrustMaterial {
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl TrustMaterial {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            ca_cert: credentials.ca_cert.clone(),
            client_cert: credentials.client_cert.clone(),
            client_key: credentials.client_key.clone(),
        }
    }

    /// Reject empty or non-PEM material before any network activity
    pub fn validate(&self) -> AgentResult<()> {
        for (label, material) in [
            ("CA certificate", &self.ca_cert),
            ("client certificate", &self.client_cert),
            ("client key", &self.client_key),
        ] {
            if material.is_empty() {
                return Err(AgentError::authentication(format!("{label} is empty")));
            }
            if !contains(material, PEM_MARKER) {
                return Err(AgentError::authentication(format!(
                    "{label} is not PEM encoded"
                )));
            }
        }
        Ok(())
    }

    /// rustls configuration for mutual TLS
    pub fn to_tls_configuration(&self) -> TlsConfiguration {
        TlsConfiguration::Simple {
            ca: self.ca_cert.clone(),
            alpn: None,
            client_auth: Some((self.client_cert.clone(), self.client_key.clone())),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

impl fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustMaterial")
            .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
            .field("client_cert", &format_args!("{} bytes", self.client_cert.len()))
            .field("client_key", &"***")
            .finish()
    }
}

/// Owns the backend socket and tracks whether it is open
pub struct TransportSession<B> {
    backend: B,
    open: bool,
}

impl<B: MqttBackend> TransportSession<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            open: false,
        }
    }

    /// Install trust material and open the encrypted connection
    pub async fn open(&mut self, credentials: &Credentials, timeout: Duration) -> AgentResult<()> {
        if self.open {
            return Err(AgentError::SessionAlreadyOpen);
        }

        let trust = TrustMaterial::from_credentials(credentials);
        trust.validate()?;

        debug!(endpoint = %credentials.endpoint, "Opening transport session");
        self.backend
            .open(&credentials.endpoint, &trust, timeout)
            .await?;
        self.open = true;
        info!(endpoint = %credentials.endpoint, "Transport session open");
        Ok(())
    }

    /// Tear down the connection; no-op when already closed
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.backend.close().await;
        self.open = false;
        debug!("Transport session closed");
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}
