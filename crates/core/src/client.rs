/// Cloneable overlay client
///
/// Wraps any [`NetworkClient`] engine and hands out [`OverlayStream`]s.

use crate::overlay::{MemoryNetwork, NetworkClient, OverlayError, ServiceConfig, ServiceHandle};
use crate::stream::OverlayStream;
use std::fmt;
use std::sync::Arc;
use veilport_common::{Fluent, MaybeFluent};

/// Shared handle on an overlay engine
#[derive(Clone)]
pub struct OverlayClient {
    inner: Arc<dyn NetworkClient>,
}

impl OverlayClient {
    pub fn new(inner: Arc<dyn NetworkClient>) -> Self {
        Self { inner }
    }

    /// Client of a loopback network
    pub fn memory(network: &MemoryNetwork) -> Self {
        Self::new(Arc::new(network.client()))
    }

    /// Open a stream to `host:port` through the overlay
    pub async fn connect(&self, host: &str, port: u16) -> Result<OverlayStream, OverlayError> {
        let channel = self.inner.connect(host, port).await?;
        Ok(OverlayStream::new(channel))
    }

    pub async fn publish(
        &self,
        config: ServiceConfig,
    ) -> Result<Arc<dyn ServiceHandle>, OverlayError> {
        self.inner.publish_hidden_service(config).await
    }

    /// Client whose sessions are never shared with this one
    pub fn isolated(&self) -> Self {
        Self::new(self.inner.isolated())
    }

    pub fn network(&self) -> &Arc<dyn NetworkClient> {
        &self.inner
    }

    /// Deferred client, by default on a fresh loopback network
    pub fn fluent() -> Fluent<OverlayClient> {
        Fluent::new(|| async { Ok(OverlayClient::memory(&MemoryNetwork::new())) })
    }
}

impl fmt::Debug for OverlayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OverlayClient")
    }
}

impl From<OverlayClient> for MaybeFluent<OverlayClient> {
    fn from(client: OverlayClient) -> Self {
        MaybeFluent::Value(client)
    }
}

/// Builder steps for [`OverlayClient`]
pub trait ClientBuilder {
    /// Replace the client with an isolated one
    fn isolate(&self) -> Self;
}

impl ClientBuilder for Fluent<OverlayClient> {
    fn isolate(&self) -> Self {
        self.update(|client| *client = client.isolated())
    }
}
