/// Outbound connector for HTTP clients
///
/// HTTP stacks hand the connector whatever they hold as the host, which may
/// be a bare hostname or a URL. Only the hostname is used; secure requests
/// upgrade the stream to transport security with that hostname before it is
/// returned.

use crate::client::OverlayClient;
use crate::overlay::OverlayError;
use crate::stream::OverlayStream;
use futures::future::{BoxFuture, FutureExt};
use std::future::ready;
use std::io;
use tracing::debug;
use url::Url;
use veilport_common::{Fluent, MaybeFluent, Result, VeilPortError};

#[derive(Debug, Clone)]
pub struct OverlayConnector {
    client: OverlayClient,
}

impl OverlayConnector {
    pub fn new(client: OverlayClient) -> Self {
        Self { client }
    }

    /// Connector on a client given as a value or a builder
    pub async fn from_client(client: MaybeFluent<OverlayClient>) -> Result<Self> {
        Ok(Self::new(client.resolve().await?))
    }

    pub fn client(&self) -> &OverlayClient {
        &self.client
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        secure: bool,
    ) -> std::result::Result<OverlayStream, ConnectorError> {
        let hostname = extract_hostname(host)?;
        debug!(secure, "connecting to {}:{}", hostname, port);

        let stream = self.client.connect(&hostname, port).await?;
        if secure {
            stream
                .upgrade_tls(&hostname)
                .await
                .map_err(ConnectorError::Tls)?;
        }
        Ok(stream)
    }
}

/// Hostname part of a bare `host[:port]` or of a URL
///
/// Userinfo, port, path, query and fragment are dropped and IPv6 literals
/// lose their brackets.
pub fn extract_hostname(host: &str) -> std::result::Result<String, ConnectorError> {
    let parsed = if host.contains("://") {
        Url::parse(host)
    } else {
        Url::parse(&format!("http://{}", host))
    };

    let hostname = match parsed {
        Ok(url) => url.host_str().unwrap_or_default().trim_matches(['[', ']']).to_string(),
        Err(_) => String::new(),
    };
    if hostname.is_empty() {
        return Err(ConnectorError::InvalidHost(host.to_string()));
    }
    Ok(hostname)
}

/// Parts of an [`OverlayConnector`]
#[derive(Debug, Clone, Default)]
pub struct ConnectorConf {
    /// Overlay client; a fresh loopback client when absent
    pub client: Option<MaybeFluent<OverlayClient>>,
}

impl ConnectorConf {
    pub async fn launch(self) -> Result<OverlayConnector> {
        let client = self
            .client
            .unwrap_or_else(|| MaybeFluent::Builder(OverlayClient::fluent()));
        OverlayConnector::from_client(client).await
    }
}

pub fn connector_conf() -> Fluent<ConnectorConf> {
    Fluent::new(|| ready(Ok(ConnectorConf::default())))
}

pub trait ConnectorBuilder {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self;
    fn into_connector(&self) -> BoxFuture<'static, Result<OverlayConnector>>;
}

impl ConnectorBuilder for Fluent<ConnectorConf> {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self {
        let client = client.into();
        self.update(move |conf| conf.client = Some(client.clone()))
    }

    fn into_connector(&self) -> BoxFuture<'static, Result<OverlayConnector>> {
        let builder = self.clone();
        async move { builder.materialize().await?.launch().await }.boxed()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Invalid host: {0:?}")]
    InvalidHost(String),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("Transport security upgrade failed: {0}")]
    Tls(io::Error),
}

impl From<ConnectorError> for VeilPortError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::InvalidHost(host) => VeilPortError::InvalidAddress(host),
            ConnectorError::Overlay(e) => e.into(),
            ConnectorError::Tls(e) => VeilPortError::Io(e),
        }
    }
}
