//! Outbound SMTP transport: connects to the configured upstream relay,
//! authenticates, transmits one message, and reports a typed outcome.

pub mod client;
pub mod message;
pub mod net;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use pelican_structs::fault::Fault;
use pelican_structs::task::SendTask;

/// Where and how to reach the upstream relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// SASL PLAIN credentials; authentication is skipped when absent.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Negotiate STARTTLS on non-465 ports. Port 465 always uses implicit
    /// TLS regardless of this flag.
    pub use_tls: bool,
    /// Hostname announced in EHLO.
    pub ehlo_host: String,
}

impl RelayConfig {
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

/// Typed transport failure. Every variant carries enough detail to log and
/// decide on a retry; resources are released on every exit path.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RelayError> for Fault {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Dial(detail) => Fault::TransportDial(detail),
            RelayError::Tls(detail) => Fault::TransportTls(detail),
            RelayError::Auth(detail) => Fault::TransportAuth(detail),
            RelayError::Protocol(detail) => Fault::TransportProtocol(detail),
        }
    }
}

/// The seam the worker pool sends through. The production implementation is
/// [`SmtpRelay`]; tests substitute scripted transports.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn send_task(&self, task: &SendTask) -> Result<(), RelayError>;
}

/// Production transport: one SMTP session per task against the configured
/// relay.
pub struct SmtpRelay {
    config: RelayConfig,
}

impl SmtpRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RelayTransport for SmtpRelay {
    async fn send_task(&self, task: &SendTask) -> Result<(), RelayError> {
        client::deliver(&self.config, task).await
    }
}
