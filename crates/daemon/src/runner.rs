/// Loopback daemon wiring
///
/// Builds a [`MemoryNetwork`], publishes every configured hidden service
/// with its forward routes and starts the local proxy on the same network.

use crate::api::AppState;
use crate::proxy::{proxy_conf, ProxyBridge, ProxyBuilder};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use veilport_common::{Credentials, DaemonConfig, ServiceEntry};
use veilport_core::{
    hidden_service_conf, HiddenService, HiddenServiceBuilder, MemoryNetwork, OverlayClient,
    RouteHandler,
};

/// Running services and proxy of one daemon
pub struct Daemon {
    network: MemoryNetwork,
    services: Vec<(String, Arc<HiddenService>)>,
    proxy: Option<Arc<ProxyBridge>>,
}

impl Daemon {
    pub async fn start(config: &DaemonConfig) -> Result<Self> {
        config.validate()?;

        let network = MemoryNetwork::new().with_clearnet_exit(config.overlay.allow_clearnet_exit);
        let client = OverlayClient::memory(&network);

        let mut services = Vec::with_capacity(config.services.len());
        for entry in &config.services {
            let service = publish(&client, entry)
                .await
                .with_context(|| format!("failed to publish service {:?}", entry.nickname))?;
            service
                .wait_running(Some(config.startup_timeout()))
                .await
                .with_context(|| format!("service {:?} did not start", entry.nickname))?;

            if let Some(address) = service.address() {
                info!("Service {:?} published at {}", entry.nickname, address);
            }
            services.push((entry.nickname.clone(), Arc::new(service)));
        }

        let proxy = if config.proxy.enabled {
            let mut auths = config.proxy.auths.clone();
            if auths.is_empty() && config.proxy.generate_auth {
                auths.push(Credentials::random());
            }

            let mut builder = proxy_conf()
                .client(client.clone())
                .interface(config.proxy.interface.clone())
                .auths(auths);
            if let Some(port) = config.proxy.port {
                builder = builder.port(port);
            }
            let proxy = builder.into_proxy().await.context("failed to start proxy")?;

            for auth in proxy.credentials() {
                match proxy.proxy_url(auth) {
                    Ok(url) => info!("Proxy URL: {}", url),
                    Err(e) => warn!("Cannot render proxy URL for {:?}: {}", auth.user, e),
                }
            }
            Some(Arc::new(proxy))
        } else {
            info!("Proxy disabled");
            None
        };

        Ok(Self {
            network,
            services,
            proxy,
        })
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn services(&self) -> &[(String, Arc<HiddenService>)] {
        &self.services
    }

    pub fn proxy(&self) -> Option<&Arc<ProxyBridge>> {
        self.proxy.as_ref()
    }

    pub fn api_state(&self) -> AppState {
        AppState::new(self.services.clone(), self.proxy.clone())
    }

    /// Stop the proxy and close every service
    pub async fn shutdown(&self) {
        if let Some(proxy) = &self.proxy {
            proxy.close();
        }
        for (nickname, service) in &self.services {
            if let Err(e) = service.close().await {
                warn!("Failed to close service {:?}: {}", nickname, e);
            }
        }
        info!("Daemon stopped");
    }
}

async fn publish(client: &OverlayClient, entry: &ServiceEntry) -> Result<HiddenService> {
    let mut builder = hidden_service_conf()
        .client(client.clone())
        .nickname(entry.nickname.clone());
    if let Some(secret) = &entry.secret_key_hex {
        builder = builder.from_secret(secret.clone());
    }
    for route in &entry.routes {
        builder = builder.route(route.ports.clone(), RouteHandler::forward(route.forward.clone()));
    }
    Ok(builder.into_service().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use veilport_common::RouteEntry;
    use veilport_core::ServiceKey;

    fn config_with(services: Vec<ServiceEntry>) -> DaemonConfig {
        let mut config = DaemonConfig::new();
        config.api_addr = None;
        config.proxy.interface = "127.0.0.1".to_string();
        config.services = services;
        config
    }

    #[tokio::test]
    async fn proxy_reaches_forwarded_service() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            socket.write_all(b"served").await.unwrap();
        });

        let key = ServiceKey::generate();
        let config = config_with(vec![ServiceEntry {
            nickname: "site".to_string(),
            secret_key_hex: Some(key.secret_hex()),
            routes: vec![RouteEntry {
                ports: "80".to_string(),
                forward: backend_addr.to_string(),
            }],
        }])
        .with_auth(Credentials::new("u", "p"));

        let daemon = Daemon::start(&config).await.unwrap();
        let (nickname, service) = &daemon.services()[0];
        assert_eq!(nickname, "site");
        assert_eq!(service.address(), Some(key.address()));

        let proxy = daemon.proxy().unwrap();
        assert_eq!(proxy.credentials(), &[Credentials::new("u", "p")]);

        let mut socket = TcpStream::connect(proxy.local_addr()).await.unwrap();
        let host = key.address().to_hostname();
        let mut script = vec![5, 1, 2, 1, 1, b'u', 1, b'p', 5, 1, 0, 3, host.len() as u8];
        script.extend_from_slice(host.as_bytes());
        script.extend_from_slice(&80u16.to_be_bytes());
        socket.write_all(&script).await.unwrap();

        let mut replies = [0u8; 14];
        socket.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..4], &[5, 2, 1, 0]);
        assert_eq!(replies[5], 0);

        let mut body = Vec::new();
        socket.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"served");

        daemon.shutdown().await;
        assert!(daemon.network().published().is_empty());
    }

    #[tokio::test]
    async fn generates_credentials_when_none_configured() {
        let daemon = Daemon::start(&config_with(Vec::new())).await.unwrap();
        let proxy = daemon.proxy().unwrap();
        assert_eq!(proxy.credentials().len(), 1);
        assert_eq!(proxy.credentials()[0].user.len(), 12);
        assert_eq!(proxy.credentials()[0].pass.len(), 24);

        let mut config = config_with(Vec::new());
        config.proxy.generate_auth = false;
        let daemon = Daemon::start(&config).await.unwrap();
        assert!(daemon.proxy().unwrap().credentials().is_empty());
    }

    #[tokio::test]
    async fn disabled_proxy_is_not_started() {
        let mut config = config_with(Vec::new());
        config.proxy.enabled = false;
        let daemon = Daemon::start(&config).await.unwrap();
        assert!(daemon.proxy().is_none());
        assert!(daemon.api_state().proxy.is_none());
    }

    #[tokio::test]
    async fn invalid_secret_fails_startup() {
        let config = config_with(vec![ServiceEntry {
            nickname: "broken".to_string(),
            secret_key_hex: Some("not hex".to_string()),
            routes: Vec::new(),
        }]);
        assert!(Daemon::start(&config).await.is_err());
    }

    #[tokio::test]
    async fn invalid_route_fails_startup() {
        let config = config_with(vec![ServiceEntry {
            nickname: "site".to_string(),
            secret_key_hex: None,
            routes: vec![RouteEntry {
                ports: "80-http".to_string(),
                forward: "127.0.0.1:1".to_string(),
            }],
        }]);
        assert!(Daemon::start(&config).await.is_err());
    }
}
