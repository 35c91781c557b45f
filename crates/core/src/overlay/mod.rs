/// Overlay engine boundary
///
/// The anonymizing engine itself lives behind these traits. A hidden service
/// is a [`ServiceHandle`] yielding [`RendezvousRequest`]s; each accepted
/// rendezvous becomes a [`StreamSource`] of [`StreamRequest`]s; each accepted
/// stream request is a [`ByteChannel`]. Outbound connections come straight
/// from [`NetworkClient::connect`].

mod channel;
mod memory;

pub use channel::IoChannel;
pub use memory::{MemoryClient, MemoryNetwork};

use crate::identity::ServiceKey;
use crate::service::ServiceAddress;
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use veilport_common::VeilPortError;

/// Ordered, reliable, authenticated byte stream provided by the engine
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Read at most `max` bytes; `None` or an empty chunk is end of stream
    async fn read(&self, max: usize) -> io::Result<Option<Vec<u8>>>;

    async fn write(&self, data: &[u8]) -> io::Result<()>;

    async fn flush(&self) -> io::Result<()>;

    async fn close(&self) -> io::Result<()>;

    /// Upgrade the channel in place to transport security with `peer`
    async fn upgrade_tls(&self, peer: &str) -> io::Result<()>;
}

/// Inbound stream on an accepted rendezvous
#[async_trait]
pub trait StreamRequest: Send + Sync {
    /// Destination port requested by the remote side
    fn port(&self) -> u16;

    /// Accept the stream; `None` when the remote side already went away
    async fn accept(self: Box<Self>) -> Option<Arc<dyn ByteChannel>>;
}

/// Stream requests of one rendezvous session
#[async_trait]
pub trait StreamSource: Send {
    /// Next stream request, `None` once the session ended
    async fn poll(&mut self) -> Result<Option<Box<dyn StreamRequest>>, OverlayError>;
}

/// Inbound rendezvous on a published service
#[async_trait]
pub trait RendezvousRequest: Send + Sync {
    fn id(&self) -> RendezvousId;

    /// Accept the session; `None` when it can no longer be established
    async fn accept(self: Box<Self>) -> Option<Box<dyn StreamSource>>;

    async fn reject(self: Box<Self>);
}

/// One published hidden endpoint
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    /// Next rendezvous request, `None` once the service stopped
    async fn poll(&self) -> Result<Option<Box<dyn RendezvousRequest>>, OverlayError>;

    fn state(&self) -> ServiceState;

    fn subscribe_state(&self) -> watch::Receiver<ServiceState>;

    fn address(&self) -> Option<ServiceAddress>;

    async fn close(&self) -> Result<(), OverlayError>;
}

/// Handle on the overlay engine
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn ByteChannel>, OverlayError>;

    async fn publish_hidden_service(
        &self,
        config: ServiceConfig,
    ) -> Result<Arc<dyn ServiceHandle>, OverlayError>;

    /// Client sharing engine state but never sessions with this one
    fn isolated(&self) -> Arc<dyn NetworkClient>;
}

/// Lifecycle of a published service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Bootstrapping,
    Running,
    Degraded,
    Shutdown,
    Broken,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Shutdown | ServiceState::Broken)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Bootstrapping => "bootstrapping",
            ServiceState::Running => "running",
            ServiceState::Degraded => "degraded",
            ServiceState::Shutdown => "shutdown",
            ServiceState::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// Resolves once `state` reports a terminal state or its sender is gone
pub(crate) async fn wait_terminal(mut state: watch::Receiver<ServiceState>) {
    let _ = state.wait_for(|s| s.is_terminal()).await;
}

/// Publication parameters of a hidden service
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub nickname: String,

    /// Identity key; the engine generates one when absent
    pub key: Option<ServiceKey>,
}

impl ServiceConfig {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: ServiceKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.nickname.is_empty() {
            return Err(OverlayError::InvalidConfig(
                "nickname must not be empty".to_string(),
            ));
        }
        if let Some(c) = self
            .nickname
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(OverlayError::InvalidConfig(format!(
                "nickname contains invalid character {:?}",
                c
            )));
        }
        Ok(())
    }
}

/// Identifier of a rendezvous session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RendezvousId([u8; 32]);

impl RendezvousId {
    /// Generate a random rendezvous ID
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RendezvousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Errors crossing the engine boundary
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("Invalid service config: {0}")]
    InvalidConfig(String),

    #[error("Unknown hidden service: {0}")]
    UnknownService(String),

    #[error("Hidden service already published: {0}")]
    AlreadyPublished(String),

    #[error("Rendezvous rejected by {0}")]
    RendezvousRejected(String),

    #[error("Stream to port {port} refused")]
    StreamRefused { port: u16 },

    #[error("Exit to non-overlay host {0} is not allowed")]
    ExitNotAllowed(String),

    #[error("Hidden service closed")]
    ServiceClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<OverlayError> for VeilPortError {
    fn from(err: OverlayError) -> Self {
        match err {
            OverlayError::InvalidConfig(msg) => VeilPortError::Validation(msg),
            OverlayError::UnknownService(host) | OverlayError::ExitNotAllowed(host) => {
                VeilPortError::InvalidAddress(host)
            }
            OverlayError::Io(e) => VeilPortError::Io(e),
            other => VeilPortError::Network(other.to_string()),
        }
    }
}
