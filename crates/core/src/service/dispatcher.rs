/// Hidden service dispatcher
///
/// Owns a published endpoint and drives two nested accept loops. The outer
/// loop polls the service for rendezvous requests one at a time; every
/// accepted rendezvous gets its own inner loop polling stream requests one at
/// a time. Accepted streams are routed by destination port and handed to
/// their handler on a separate task, so neither loop ever waits on user code.

use super::callbacks::{AcceptAll, ServiceCallbacks};
use super::router::{PortRouter, RouteError, RouteHandler};
use super::ServiceAddress;
use crate::client::OverlayClient;
use crate::overlay::{OverlayError, RendezvousId, ServiceConfig, ServiceHandle, ServiceState, StreamSource};
use crate::stream::OverlayStream;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veilport_common::VeilPortError;

/// Dispatch counters of one service
#[derive(Debug, Default)]
pub struct DispatchStats {
    rendezvous_accepted: AtomicU64,
    rendezvous_rejected: AtomicU64,
    streams_accepted: AtomicU64,
    streams_declined: AtomicU64,
    streams_unrouted: AtomicU64,
    streams_dispatched: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub rendezvous_accepted: u64,
    pub rendezvous_rejected: u64,
    pub streams_accepted: u64,
    pub streams_declined: u64,
    pub streams_unrouted: u64,
    pub streams_dispatched: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            rendezvous_accepted: self.rendezvous_accepted.load(Ordering::Relaxed),
            rendezvous_rejected: self.rendezvous_rejected.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            streams_declined: self.streams_declined.load(Ordering::Relaxed),
            streams_unrouted: self.streams_unrouted.load(Ordering::Relaxed),
            streams_dispatched: self.streams_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// A published hidden service dispatching streams to routed handlers
pub struct HiddenService {
    client: OverlayClient,
    handle: Arc<dyn ServiceHandle>,
    router: Arc<RwLock<PortRouter>>,
    stats: Arc<DispatchStats>,
    outer: JoinHandle<()>,
}

impl HiddenService {
    /// Start dispatching on an already published handle
    pub fn new(
        client: OverlayClient,
        handle: Arc<dyn ServiceHandle>,
        callbacks: Option<Arc<dyn ServiceCallbacks>>,
        router: PortRouter,
    ) -> Self {
        let callbacks = callbacks.unwrap_or_else(|| Arc::new(AcceptAll));
        let router = Arc::new(RwLock::new(router));
        let stats = Arc::new(DispatchStats::default());

        let outer = tokio::spawn(rendezvous_loop(
            Arc::clone(&handle),
            callbacks,
            Arc::clone(&router),
            Arc::clone(&stats),
        ));

        Self {
            client,
            handle,
            router,
            stats,
            outer,
        }
    }

    /// Publish `config` through `client` and start dispatching
    pub async fn create(
        client: OverlayClient,
        config: ServiceConfig,
        callbacks: Option<Arc<dyn ServiceCallbacks>>,
        router: PortRouter,
    ) -> Result<Self, ServiceError> {
        let handle = client.publish(config).await?;
        Ok(Self::new(client, handle, callbacks, router))
    }

    pub async fn add_route(&self, specifier: &str, handler: RouteHandler) -> Result<(), RouteError> {
        self.router.write().await.register(specifier, handler)
    }

    /// Wait until the service runs
    ///
    /// Fails at once when the service is broken, with `Closed` when it shuts
    /// down first, and with `Timeout` once `timeout` elapses. A timeout
    /// leaves the service published.
    pub async fn wait_running(&self, timeout: Option<Duration>) -> Result<(), ServiceError> {
        let mut state = self.handle.subscribe_state();
        let wait = async move {
            let reached = state
                .wait_for(|s| matches!(s, ServiceState::Running) || s.is_terminal())
                .await
                .map(|s| *s)
                .map_err(|_| ServiceError::Closed)?;
            match reached {
                ServiceState::Running => Ok(()),
                ServiceState::Broken => Err(ServiceError::Broken),
                _ => Err(ServiceError::Closed),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ServiceError::Timeout(limit))?,
            None => wait.await,
        }
    }

    pub fn address(&self) -> Option<ServiceAddress> {
        self.handle.address()
    }

    pub fn state(&self) -> ServiceState {
        self.handle.state()
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    pub fn client(&self) -> &OverlayClient {
        &self.client
    }

    /// Whether the rendezvous loop is still polling
    pub fn is_dispatching(&self) -> bool {
        !self.outer.is_finished()
    }

    /// Stop the service; pending polls settle and the loops wind down
    pub async fn close(&self) -> Result<(), ServiceError> {
        info!("closing hidden service {:?}", self.address());
        self.handle.close().await?;
        Ok(())
    }
}

impl Drop for HiddenService {
    fn drop(&mut self) {
        self.outer.abort();
    }
}

async fn rendezvous_loop(
    handle: Arc<dyn ServiceHandle>,
    callbacks: Arc<dyn ServiceCallbacks>,
    router: Arc<RwLock<PortRouter>>,
    stats: Arc<DispatchStats>,
) {
    loop {
        let request = match handle.poll().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                info!(state = %handle.state(), "rendezvous polling ended");
                break;
            }
            Err(e) => {
                warn!(error = %e, "rendezvous polling failed");
                break;
            }
        };

        let id = request.id();
        if !callbacks.on_rendezvous(&*request) {
            debug!(rendezvous = %id, "rendezvous rejected");
            DispatchStats::bump(&stats.rendezvous_rejected);
            tokio::spawn(request.reject());
            continue;
        }

        let Some(source) = request.accept().await else {
            debug!(rendezvous = %id, "rendezvous vanished before accept");
            continue;
        };
        debug!(rendezvous = %id, "rendezvous accepted");
        DispatchStats::bump(&stats.rendezvous_accepted);

        tokio::spawn(stream_loop(
            id,
            source,
            Arc::clone(&callbacks),
            Arc::clone(&router),
            Arc::clone(&stats),
        ));
    }
}

async fn stream_loop(
    id: RendezvousId,
    mut source: Box<dyn StreamSource>,
    callbacks: Arc<dyn ServiceCallbacks>,
    router: Arc<RwLock<PortRouter>>,
    stats: Arc<DispatchStats>,
) {
    loop {
        let request = match source.poll().await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(rendezvous = %id, "stream polling ended");
                break;
            }
            Err(e) => {
                debug!(rendezvous = %id, error = %e, "stream polling failed");
                break;
            }
        };

        let port = request.port();
        if !callbacks.on_stream_request(&*request) {
            debug!(rendezvous = %id, port, "stream request declined");
            DispatchStats::bump(&stats.streams_declined);
            continue;
        }

        let Some(channel) = request.accept().await else {
            debug!(rendezvous = %id, port, "stream vanished before accept");
            continue;
        };
        DispatchStats::bump(&stats.streams_accepted);

        let mut stream = OverlayStream::new(channel);
        callbacks.on_stream(&mut stream);

        let handler = router.read().await.resolve(port).cloned();
        let Some(handler) = handler else {
            warn!(rendezvous = %id, port, "no route for port, dropping stream");
            DispatchStats::bump(&stats.streams_unrouted);
            continue;
        };

        debug!(rendezvous = %id, port, "dispatching stream");
        DispatchStats::bump(&stats.streams_dispatched);
        tokio::spawn(async move {
            if let Err(e) = handler.dispatch(stream).await {
                warn!(port, error = %e, "stream handler failed");
            }
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service did not start within {0:?}")]
    Timeout(Duration),

    #[error("Service is broken")]
    Broken,

    #[error("Service closed")]
    Closed,

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Route(#[from] RouteError),
}

impl From<ServiceError> for VeilPortError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Timeout(_) => VeilPortError::Timeout,
            ServiceError::Overlay(e) => e.into(),
            ServiceError::Route(e) => e.into(),
            other => VeilPortError::ServiceBroken(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryNetwork;
    use crate::service::CallbackSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn reply(text: &'static [u8]) -> RouteHandler {
        RouteHandler::callback(move |mut stream: OverlayStream| async move {
            let _ = stream.write_all(text).await;
            let _ = stream.shutdown().await;
        })
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn start(
        network: &MemoryNetwork,
        callbacks: Option<Arc<dyn ServiceCallbacks>>,
        router: PortRouter,
    ) -> (HiddenService, String) {
        init_tracing();
        let service = HiddenService::create(
            OverlayClient::memory(network),
            ServiceConfig::new("test"),
            callbacks,
            router,
        )
        .await
        .unwrap();
        service
            .wait_running(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let host = service.address().unwrap().to_hostname();
        (service, host)
    }

    async fn fetch(client: &OverlayClient, host: &str, port: u16) -> Vec<u8> {
        let mut stream = client.connect(host, port).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn routes_by_port_with_wildcard_fallback() {
        let network = MemoryNetwork::new();
        let router = PortRouter::new()
            .with_route("80", reply(b"eighty"))
            .unwrap()
            .with_route("*", reply(b"any"))
            .unwrap();
        let (service, host) = start(&network, None, router).await;
        let client = OverlayClient::memory(&network);

        assert_eq!(fetch(&client, &host, 80).await, b"eighty");
        assert_eq!(fetch(&client, &host, 81).await, b"any");
        assert_eq!(fetch(&client, &host, 443).await, b"any");

        let stats = service.stats();
        assert_eq!(stats.rendezvous_accepted, 1);
        assert_eq!(stats.streams_dispatched, 3);
    }

    #[tokio::test]
    async fn forwards_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        let network = MemoryNetwork::new();
        let router = PortRouter::new()
            .with_route("*", RouteHandler::forward(target))
            .unwrap();
        let (_service, host) = start(&network, None, router).await;

        let mut stream = OverlayClient::memory(&network)
            .connect(&host, 8080)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }

    #[tokio::test]
    async fn unrouted_stream_is_closed() {
        let network = MemoryNetwork::new();
        let router = PortRouter::new().with_route("80", reply(b"x")).unwrap();
        let (service, host) = start(&network, None, router).await;

        let client = OverlayClient::memory(&network);
        assert!(fetch(&client, &host, 81).await.is_empty());
        assert_eq!(service.stats().streams_unrouted, 1);
    }

    #[tokio::test]
    async fn rejected_rendezvous_fails_connect() {
        let network = MemoryNetwork::new();
        let callbacks = CallbackSet::new().on_rendezvous(|_| false);
        let router = PortRouter::new().with_route("*", reply(b"x")).unwrap();
        let (service, host) = start(&network, Some(Arc::new(callbacks)), router).await;

        let err = OverlayClient::memory(&network)
            .connect(&host, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::RendezvousRejected(_)));
        assert_eq!(service.stats().rendezvous_rejected, 1);
        assert!(service.is_dispatching());
    }

    #[tokio::test]
    async fn declined_stream_request_is_refused() {
        let network = MemoryNetwork::new();
        let callbacks = CallbackSet::new().on_stream_request(|request| request.port() != 22);
        let router = PortRouter::new().with_route("*", reply(b"ok")).unwrap();
        let (service, host) = start(&network, Some(Arc::new(callbacks)), router).await;
        let client = OverlayClient::memory(&network);

        let err = client.connect(&host, 22).await.unwrap_err();
        assert!(matches!(err, OverlayError::StreamRefused { port: 22 }));
        assert_eq!(fetch(&client, &host, 80).await, b"ok");
        assert_eq!(service.stats().streams_declined, 1);
    }

    #[tokio::test]
    async fn isolated_clients_use_separate_sessions() {
        let network = MemoryNetwork::new();
        let router = PortRouter::new().with_route("*", reply(b"ok")).unwrap();
        let (service, host) = start(&network, None, router).await;

        let client = OverlayClient::memory(&network);
        fetch(&client, &host, 1).await;
        fetch(&client, &host, 2).await;
        assert_eq!(service.stats().rendezvous_accepted, 1);

        fetch(&client.isolated(), &host, 3).await;
        assert_eq!(service.stats().rendezvous_accepted, 2);
    }

    #[tokio::test]
    async fn routes_added_after_start() {
        let network = MemoryNetwork::new();
        let (service, host) = start(&network, None, PortRouter::new()).await;
        service.add_route("9000", reply(b"late")).await.unwrap();
        assert!(service.add_route("bogus", reply(b"x")).await.is_err());

        let client = OverlayClient::memory(&network);
        assert_eq!(fetch(&client, &host, 9000).await, b"late");
    }

    #[tokio::test]
    async fn on_stream_sees_accepted_streams() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let callbacks = CallbackSet::new().on_stream(move |_stream| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let network = MemoryNetwork::new();
        let router = PortRouter::new().with_route("*", reply(b"ok")).unwrap();
        let (_service, host) = start(&network, Some(Arc::new(callbacks)), router).await;

        fetch(&OverlayClient::memory(&network), &host, 80).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_running_times_out_without_closing() {
        let network = MemoryNetwork::new().with_publish_delay(Duration::from_secs(60));
        let service = HiddenService::create(
            OverlayClient::memory(&network),
            ServiceConfig::new("slow"),
            None,
            PortRouter::new(),
        )
        .await
        .unwrap();

        let err = service
            .wait_running(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
        assert_eq!(service.state(), ServiceState::Bootstrapping);
        assert!(service.is_dispatching());
    }

    #[tokio::test]
    async fn wait_running_fails_when_broken() {
        let network = MemoryNetwork::new().with_publish_delay(Duration::from_secs(60));
        let service = HiddenService::create(
            OverlayClient::memory(&network),
            ServiceConfig::new("broken"),
            None,
            PortRouter::new(),
        )
        .await
        .unwrap();

        let address = service.address().unwrap();
        network.set_service_state(&address, ServiceState::Broken);
        let err = service.wait_running(None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Broken));
    }

    #[tokio::test]
    async fn close_settles_outstanding_poll() {
        let network = MemoryNetwork::new();
        let (service, host) = start(&network, None, PortRouter::new()).await;

        service.close().await.unwrap();
        for _ in 0..100 {
            if !service.is_dispatching() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!service.is_dispatching());
        assert_eq!(service.state(), ServiceState::Shutdown);
        assert!(matches!(
            service.wait_running(None).await,
            Err(ServiceError::Closed)
        ));

        let err = OverlayClient::memory(&network)
            .connect(&host, 80)
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::UnknownService(_)));
    }
}
