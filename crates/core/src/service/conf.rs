/// Deferred hidden service assembly
///
/// Every part of a hidden service (client, publication config, key, routes)
/// can be given as a finished value or as a builder; nothing is created until
/// [`HiddenServiceBuilder::into_service`] materializes the whole set.

use super::callbacks::ServiceCallbacks;
use super::dispatcher::HiddenService;
use super::router::{PortRouter, RouteHandler};
use crate::client::OverlayClient;
use crate::identity::{generate_vanity, ServiceKey};
use crate::overlay::ServiceConfig;
use futures::future::{BoxFuture, FutureExt};
use std::future::ready;
use std::sync::Arc;
use veilport_common::config::service::VANITY_YIELD_EVERY;
use veilport_common::{Fluent, MaybeFluent, Result, VeilPortError};

/// Everything needed to start a [`HiddenService`]
#[derive(Clone)]
pub struct HiddenServiceConf {
    /// Overlay client; a fresh loopback client when absent
    pub client: Option<MaybeFluent<OverlayClient>>,
    pub service: MaybeFluent<ServiceConfig>,
    /// Overrides the key of `service` when set
    pub key: Option<MaybeFluent<ServiceKey>>,
    pub callbacks: Option<Arc<dyn ServiceCallbacks>>,
    pub routes: Vec<(String, RouteHandler)>,
}

impl Default for HiddenServiceConf {
    fn default() -> Self {
        Self {
            client: None,
            service: MaybeFluent::Value(ServiceConfig::default()),
            key: None,
            callbacks: None,
            routes: Vec::new(),
        }
    }
}

impl HiddenServiceConf {
    /// Resolve every part and start dispatching
    pub async fn launch(self) -> Result<HiddenService> {
        let client = match self.client {
            Some(client) => client.resolve().await?,
            None => OverlayClient::fluent().materialize().await?,
        };

        let mut config = self.service.resolve().await?;
        if let Some(key) = self.key {
            config.key = Some(key.resolve().await?);
        }

        let mut router = PortRouter::new();
        for (specifier, handler) in self.routes {
            router.register(&specifier, handler)?;
        }

        Ok(HiddenService::create(client, config, self.callbacks, router).await?)
    }
}

impl From<ServiceConfig> for MaybeFluent<ServiceConfig> {
    fn from(config: ServiceConfig) -> Self {
        MaybeFluent::Value(config)
    }
}

impl From<ServiceKey> for MaybeFluent<ServiceKey> {
    fn from(key: ServiceKey) -> Self {
        MaybeFluent::Value(key)
    }
}

pub fn service_config() -> Fluent<ServiceConfig> {
    Fluent::from_default()
}

/// Deferred key, freshly generated unless a step replaces it
pub fn service_key() -> Fluent<ServiceKey> {
    Fluent::new(|| ready(Ok(ServiceKey::generate())))
}

pub fn hidden_service_conf() -> Fluent<HiddenServiceConf> {
    Fluent::from_default()
}

pub trait ServiceConfigBuilder {
    fn nickname(&self, nickname: impl Into<String>) -> Self;
    fn key(&self, key: ServiceKey) -> Self;
}

impl ServiceConfigBuilder for Fluent<ServiceConfig> {
    fn nickname(&self, nickname: impl Into<String>) -> Self {
        let nickname = nickname.into();
        self.update(move |config| config.nickname = nickname.clone())
    }

    fn key(&self, key: ServiceKey) -> Self {
        self.update(move |config| config.key = Some(key.clone()))
    }
}

pub trait ServiceKeyBuilder {
    /// Use the key with this hex encoded secret
    fn from_secret(&self, secret_hex: impl Into<String>) -> Self;
    /// Search for a key whose address starts with `prefix`
    fn vanity(&self, prefix: impl Into<String>) -> Self;
}

impl ServiceKeyBuilder for Fluent<ServiceKey> {
    fn from_secret(&self, secret_hex: impl Into<String>) -> Self {
        let secret = secret_hex.into();
        self.push(move |_| ready(ServiceKey::from_secret_hex(&secret).map_err(VeilPortError::from)))
    }

    fn vanity(&self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.push(move |_| {
            let prefix = prefix.clone();
            async move {
                generate_vanity(&prefix, VANITY_YIELD_EVERY)
                    .await
                    .map_err(VeilPortError::from)
            }
        })
    }
}

pub trait HiddenServiceBuilder {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self;
    fn service(&self, config: impl Into<MaybeFluent<ServiceConfig>>) -> Self;
    fn nickname(&self, nickname: impl Into<String>) -> Self;
    fn key(&self, key: impl Into<MaybeFluent<ServiceKey>>) -> Self;
    fn from_secret(&self, secret_hex: impl Into<String>) -> Self;
    fn vanity(&self, prefix: impl Into<String>) -> Self;
    fn callbacks(&self, callbacks: Arc<dyn ServiceCallbacks>) -> Self;
    fn route(&self, specifier: impl Into<String>, handler: RouteHandler) -> Self;
    fn into_service(&self) -> BoxFuture<'static, Result<HiddenService>>;
}

impl HiddenServiceBuilder for Fluent<HiddenServiceConf> {
    fn client(&self, client: impl Into<MaybeFluent<OverlayClient>>) -> Self {
        let client = client.into();
        self.update(move |conf| conf.client = Some(client.clone()))
    }

    fn service(&self, config: impl Into<MaybeFluent<ServiceConfig>>) -> Self {
        let config = config.into();
        self.update(move |conf| conf.service = config.clone())
    }

    fn nickname(&self, nickname: impl Into<String>) -> Self {
        let nickname = nickname.into();
        self.update(move |conf| {
            let nickname = nickname.clone();
            conf.service = conf
                .service
                .clone()
                .update(move |config| config.nickname = nickname.clone());
        })
    }

    fn key(&self, key: impl Into<MaybeFluent<ServiceKey>>) -> Self {
        let key = key.into();
        self.update(move |conf| conf.key = Some(key.clone()))
    }

    fn from_secret(&self, secret_hex: impl Into<String>) -> Self {
        self.key(service_key().from_secret(secret_hex))
    }

    fn vanity(&self, prefix: impl Into<String>) -> Self {
        self.key(service_key().vanity(prefix))
    }

    fn callbacks(&self, callbacks: Arc<dyn ServiceCallbacks>) -> Self {
        self.update(move |conf| conf.callbacks = Some(Arc::clone(&callbacks)))
    }

    fn route(&self, specifier: impl Into<String>, handler: RouteHandler) -> Self {
        let specifier = specifier.into();
        self.update(move |conf| conf.routes.push((specifier.clone(), handler.clone())))
    }

    fn into_service(&self) -> BoxFuture<'static, Result<HiddenService>> {
        let builder = self.clone();
        async move { builder.materialize().await?.launch().await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryNetwork;
    use crate::stream::OverlayStream;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn builder_assembles_a_running_service() {
        let network = MemoryNetwork::new();
        let key = ServiceKey::generate();

        let builder = hidden_service_conf()
            .client(OverlayClient::memory(&network))
            .nickname("built")
            .from_secret(key.secret_hex())
            .route(
                "7000-7010",
                RouteHandler::callback(|mut stream: OverlayStream| async move {
                    let _ = stream.write_all(b"hi").await;
                    let _ = stream.shutdown().await;
                }),
            );

        let service = builder.into_service().await.unwrap();
        service
            .wait_running(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(service.address(), Some(key.address()));
        assert_eq!(network.published(), vec!["built".to_string()]);

        let mut stream = OverlayClient::memory(&network)
            .connect(&key.address().to_hostname(), 7005)
            .await
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hi");
    }

    #[tokio::test]
    async fn invalid_route_fails_launch() {
        let result = hidden_service_conf()
            .nickname("bad")
            .route("1-2-3", RouteHandler::forward("127.0.0.1:1"))
            .into_service()
            .await;
        assert!(matches!(result, Err(VeilPortError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_nickname_fails_launch() {
        let result = hidden_service_conf().into_service().await;
        assert!(matches!(result, Err(VeilPortError::Validation(_))));
    }

    #[tokio::test]
    async fn key_builders() {
        let key = ServiceKey::generate();
        let restored = service_key()
            .from_secret(key.secret_hex())
            .materialize()
            .await
            .unwrap();
        assert_eq!(restored.address(), key.address());

        let vanity = service_key().vanity("c").materialize().await.unwrap();
        assert!(vanity.address().to_base32().starts_with('c'));

        assert!(service_key().vanity("0").materialize().await.is_err());
        assert!(service_key().from_secret("nothex").materialize().await.is_err());
    }

    #[tokio::test]
    async fn service_config_builder() {
        let key = ServiceKey::generate();
        let config = service_config()
            .nickname("cfg")
            .key(key.clone())
            .materialize()
            .await
            .unwrap();
        assert_eq!(config.nickname, "cfg");
        assert_eq!(config.key.map(|k| k.address()), Some(key.address()));
    }
}
