/// Deferred proxy assembly

use super::ProxyBridge;
use futures::future::{BoxFuture, FutureExt};
use veilport_common::config::proxy::DEFAULT_INTERFACE;
use veilport_common::{Credentials, Fluent, MaybeFluent, Result};
use veilport_core::OverlayClient;

/// Everything needed to start a [`ProxyBridge`]
#[derive(Debug, Clone)]
pub struct ProxyConf {
    /// Overlay client; a fresh loopback client when absent
    pub client: Option<MaybeFluent<OverlayClient>>,
    pub interface: String,
    pub port: Option<u16>,
    pub auths: Vec<Credentials>,
}

impl Default for ProxyConf {
    fn default() -> Self {
        Self {
            client: None,
            interface: DEFAULT_INTERFACE.to_string(),
            port: None,
            auths: Vec::new(),
        }
    }
}

impl ProxyConf {
    pub async fn launch(self) -> Result<ProxyBridge> {
        let client = match self.client {
            Some(client) => client.resolve().await?,
            None => OverlayClient::fluent().materialize().await?,
        };
        Ok(ProxyBridge::bind(client, &self.interface, self.port, self.auths).await?)
    }
}

pub fn proxy_conf() -> Fluent<ProxyConf> {
    Fluent::from_default()
}

pub trait ProxyBuilder {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self;
    fn interface(&self, interface: impl Into<String>) -> Self;
    fn port(&self, port: u16) -> Self;
    /// Replace the credential list
    fn auths(&self, auths: Vec<Credentials>) -> Self;
    fn add_auth(&self, auth: Credentials) -> Self;
    fn into_proxy(&self) -> BoxFuture<'static, Result<ProxyBridge>>;
}

impl ProxyBuilder for Fluent<ProxyConf> {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self {
        let client = client.into();
        self.update(move |conf| conf.client = Some(client.clone()))
    }

    fn interface(&self, interface: impl Into<String>) -> Self {
        let interface = interface.into();
        self.update(move |conf| conf.interface = interface.clone())
    }

    fn port(&self, port: u16) -> Self {
        self.update(move |conf| conf.port = Some(port))
    }

    fn auths(&self, auths: Vec<Credentials>) -> Self {
        self.update(move |conf| conf.auths = auths.clone())
    }

    fn add_auth(&self, auth: Credentials) -> Self {
        self.update(move |conf| conf.auths.push(auth.clone()))
    }

    fn into_proxy(&self) -> BoxFuture<'static, Result<ProxyBridge>> {
        let builder = self.clone();
        async move { builder.materialize().await?.launch().await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilport_core::MemoryNetwork;

    #[tokio::test]
    async fn builder_steps_apply_in_order() {
        let network = MemoryNetwork::new();
        let proxy = proxy_conf()
            .client(OverlayClient::memory(&network))
            .interface("127.0.0.1")
            .auths(vec![Credentials::new("a", "1")])
            .add_auth(Credentials::new("b", "2"))
            .into_proxy()
            .await
            .unwrap();

        assert_eq!(proxy.interface(), "127.0.0.1");
        let users: Vec<_> = proxy.credentials().iter().map(|c| c.user.as_str()).collect();
        assert_eq!(users, ["a", "b"]);
    }

    #[tokio::test]
    async fn later_auths_replace_earlier_ones() {
        let conf = proxy_conf()
            .add_auth(Credentials::new("a", "1"))
            .auths(vec![Credentials::new("c", "3")])
            .materialize()
            .await
            .unwrap();
        assert_eq!(conf.auths, vec![Credentials::new("c", "3")]);
        assert_eq!(conf.interface, DEFAULT_INTERFACE);
        assert!(conf.client.is_none());
    }

    #[tokio::test]
    async fn builder_is_reusable() {
        let base = proxy_conf().interface("127.0.0.1");
        let first = base.add_auth(Credentials::random()).into_proxy().await.unwrap();
        let second = base.into_proxy().await.unwrap();

        assert_eq!(first.credentials().len(), 1);
        assert!(second.credentials().is_empty());
        assert_ne!(first.port(), second.port());
    }
}
