/// In-process loopback overlay
///
/// Implements the engine boundary with tokio pipes so hidden services and the
/// proxy can run without a real anonymizing network. Hidden services are
/// looked up by address in a shared table; clients keep one rendezvous
/// session per service and open every stream inside it. Hosts outside the
/// overlay are reachable only when clearnet exit is enabled.

use super::{
    wait_terminal, ByteChannel, IoChannel, NetworkClient, OverlayError, RendezvousId,
    RendezvousRequest, ServiceConfig, ServiceHandle, ServiceState, StreamRequest, StreamSource,
};
use crate::identity::ServiceKey;
use crate::service::ServiceAddress;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OnceCell};
use tracing::{debug, info};
use veilport_common::config::stream::PIPE_CAPACITY;

/// Loopback overlay shared by every client created from it
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    services: StdMutex<HashMap<ServiceAddress, Published>>,
    allow_clearnet_exit: AtomicBool,
    publish_delay_ms: AtomicU64,
    connect_attempts: AtomicU64,
    next_isolation: AtomicU64,
}

struct Published {
    nickname: String,
    rendezvous: mpsc::UnboundedSender<MemoryRendezvous>,
    state: Arc<watch::Sender<ServiceState>>,
}

impl Shared {
    fn lookup(
        &self,
        address: &ServiceAddress,
    ) -> Option<(mpsc::UnboundedSender<MemoryRendezvous>, watch::Receiver<ServiceState>)> {
        let services = self.services.lock().ok()?;
        services
            .get(address)
            .map(|entry| (entry.rendezvous.clone(), entry.state.subscribe()))
    }

    fn remove(&self, address: &ServiceAddress) {
        if let Ok(mut services) = self.services.lock() {
            services.remove(address);
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let hostnames outside the overlay leave as plain TCP
    pub fn with_clearnet_exit(self, allow: bool) -> Self {
        self.shared.allow_clearnet_exit.store(allow, Ordering::SeqCst);
        self
    }

    /// Time published services spend bootstrapping before they run
    pub fn with_publish_delay(self, delay: Duration) -> Self {
        self.shared
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            shared: Arc::clone(&self.shared),
            sessions: Arc::default(),
            isolation: self.shared.next_isolation.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Number of outbound `connect` calls made by any client
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Nicknames of the currently published services
    pub fn published(&self) -> Vec<String> {
        match self.shared.services.lock() {
            Ok(services) => services.values().map(|s| s.nickname.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Force the state of a published service
    pub fn set_service_state(&self, address: &ServiceAddress, state: ServiceState) -> bool {
        let Ok(services) = self.shared.services.lock() else {
            return false;
        };
        match services.get(address) {
            Some(entry) => {
                entry.state.send_replace(state);
                true
            }
            None => false,
        }
    }
}

type Session = mpsc::UnboundedSender<PendingStream>;

/// Session with one service, filled by the first successful rendezvous
type SessionSlot = Arc<OnceCell<Session>>;

/// Client of a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    sessions: Arc<StdMutex<HashMap<ServiceAddress, SessionSlot>>>,
    isolation: u64,
}

impl MemoryClient {
    pub fn isolation_id(&self) -> u64 {
        self.isolation
    }

    async fn rendezvous(&self, host: &str, address: ServiceAddress) -> Result<Session, OverlayError> {
        let (rendezvous, state) = self
            .shared
            .lookup(&address)
            .ok_or_else(|| OverlayError::UnknownService(host.to_string()))?;
        if state.borrow().is_terminal() {
            return Err(OverlayError::UnknownService(host.to_string()));
        }

        let (streams_tx, streams_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = oneshot::channel();
        let request = MemoryRendezvous {
            id: RendezvousId::generate(),
            streams: streams_rx,
            state,
            decision: decision_tx,
        };
        debug!(isolation = self.isolation, rendezvous = %request.id, "requesting rendezvous with {}", host);

        rendezvous
            .send(request)
            .map_err(|_| OverlayError::UnknownService(host.to_string()))?;

        match decision_rx.await {
            Ok(true) => Ok(streams_tx),
            Ok(false) => Err(OverlayError::RendezvousRejected(host.to_string())),
            Err(_) => Err(OverlayError::ServiceClosed),
        }
    }

    /// Slot for `address`, replacing one whose session has ended
    fn session_slot(&self, address: ServiceAddress) -> SessionSlot {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = sessions.entry(address).or_default();
        if slot.get().is_some_and(|session| session.is_closed()) {
            *slot = SessionSlot::default();
        }
        Arc::clone(slot)
    }

    fn forget_session(&self, address: &ServiceAddress, slot: &SessionSlot) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions
            .get(address)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(address);
        }
    }

    async fn open_stream(
        &self,
        host: &str,
        address: ServiceAddress,
        port: u16,
    ) -> Result<Arc<dyn ByteChannel>, OverlayError> {
        // Only connects to the same service wait on a pending rendezvous
        let slot = self.session_slot(address);
        let session = slot
            .get_or_try_init(|| self.rendezvous(host, address))
            .await?
            .clone();

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingStream {
            port,
            io: remote,
            reply: reply_tx,
        };
        if session.send(pending).is_err() {
            self.forget_session(&address, &slot);
            return Err(OverlayError::ServiceClosed);
        }

        match reply_rx.await {
            Ok(()) => Ok(Arc::new(IoChannel::overlay(local, Some(host.to_string())))),
            Err(_) => Err(OverlayError::StreamRefused { port }),
        }
    }
}

#[async_trait]
impl NetworkClient for MemoryClient {
    async fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn ByteChannel>, OverlayError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if ServiceAddress::is_veil_address(host) {
            let address = ServiceAddress::from_hostname(host)
                .map_err(|_| OverlayError::UnknownService(host.to_string()))?;
            return self.open_stream(host, address, port).await;
        }

        if !self.shared.allow_clearnet_exit.load(Ordering::SeqCst) {
            return Err(OverlayError::ExitNotAllowed(host.to_string()));
        }

        debug!("exiting to {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Arc::new(IoChannel::plain(stream)))
    }

    async fn publish_hidden_service(
        &self,
        config: ServiceConfig,
    ) -> Result<Arc<dyn ServiceHandle>, OverlayError> {
        config.validate()?;
        let key = config.key.unwrap_or_else(ServiceKey::generate);
        let address = key.address();

        let (rendezvous_tx, rendezvous_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ServiceState::Bootstrapping);
        let state_tx = Arc::new(state_tx);

        {
            let mut services = self
                .shared
                .services
                .lock()
                .map_err(|_| OverlayError::InvalidConfig("service table poisoned".to_string()))?;
            if services.contains_key(&address) {
                return Err(OverlayError::AlreadyPublished(address.to_hostname()));
            }
            services.insert(
                address,
                Published {
                    nickname: config.nickname.clone(),
                    rendezvous: rendezvous_tx,
                    state: Arc::clone(&state_tx),
                },
            );
        }

        let delay = Duration::from_millis(self.shared.publish_delay_ms.load(Ordering::SeqCst));
        let bootstrap = Arc::clone(&state_tx);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bootstrap.send_if_modified(|state| {
                if *state == ServiceState::Bootstrapping {
                    *state = ServiceState::Running;
                    true
                } else {
                    false
                }
            });
        });

        info!(nickname = %config.nickname, "published {}", address);

        Ok(Arc::new(MemoryServiceHandle {
            address,
            requests: Mutex::new(rendezvous_rx),
            state: state_tx,
            shared: Arc::clone(&self.shared),
        }))
    }

    fn isolated(&self) -> Arc<dyn NetworkClient> {
        Arc::new(MemoryClient {
            shared: Arc::clone(&self.shared),
            sessions: Arc::default(),
            isolation: self.shared.next_isolation.fetch_add(1, Ordering::SeqCst),
        })
    }
}

struct MemoryServiceHandle {
    address: ServiceAddress,
    requests: Mutex<mpsc::UnboundedReceiver<MemoryRendezvous>>,
    state: Arc<watch::Sender<ServiceState>>,
    shared: Arc<Shared>,
}

impl MemoryServiceHandle {
    fn shutdown(&self) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ServiceState::Shutdown;
                true
            }
        });
        self.shared.remove(&self.address);

        // A poll in progress drains the queue itself once it sees the state
        if let Ok(mut requests) = self.requests.try_lock() {
            drain(&mut requests);
        }
    }
}

/// Close `queue` and drop everything still in it, failing the waiting peers
fn drain<T>(queue: &mut mpsc::UnboundedReceiver<T>) {
    queue.close();
    while queue.try_recv().is_ok() {}
}

#[async_trait]
impl ServiceHandle for MemoryServiceHandle {
    async fn poll(&self) -> Result<Option<Box<dyn RendezvousRequest>>, OverlayError> {
        let terminal = wait_terminal(self.state.subscribe());
        let mut requests = self.requests.lock().await;
        tokio::select! {
            biased;
            _ = terminal => {
                drain(&mut requests);
                Ok(None)
            }
            request = requests.recv() => {
                Ok(request.map(|r| Box::new(r) as Box<dyn RendezvousRequest>))
            }
        }
    }

    fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn address(&self) -> Option<ServiceAddress> {
        Some(self.address)
    }

    async fn close(&self) -> Result<(), OverlayError> {
        self.shutdown();
        Ok(())
    }
}

impl Drop for MemoryServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct MemoryRendezvous {
    id: RendezvousId,
    streams: mpsc::UnboundedReceiver<PendingStream>,
    state: watch::Receiver<ServiceState>,
    decision: oneshot::Sender<bool>,
}

#[async_trait]
impl RendezvousRequest for MemoryRendezvous {
    fn id(&self) -> RendezvousId {
        self.id
    }

    async fn accept(self: Box<Self>) -> Option<Box<dyn StreamSource>> {
        let MemoryRendezvous {
            streams,
            state,
            decision,
            ..
        } = *self;
        decision.send(true).ok()?;
        Some(Box::new(MemoryStreamSource { streams, state }))
    }

    async fn reject(self: Box<Self>) {
        let _ = self.decision.send(false);
    }
}

struct MemoryStreamSource {
    streams: mpsc::UnboundedReceiver<PendingStream>,
    state: watch::Receiver<ServiceState>,
}

#[async_trait]
impl StreamSource for MemoryStreamSource {
    async fn poll(&mut self) -> Result<Option<Box<dyn StreamRequest>>, OverlayError> {
        let terminal = wait_terminal(self.state.clone());
        tokio::select! {
            biased;
            _ = terminal => {
                drain(&mut self.streams);
                Ok(None)
            }
            pending = self.streams.recv() => {
                Ok(pending.map(|p| Box::new(p) as Box<dyn StreamRequest>))
            }
        }
    }
}

struct PendingStream {
    port: u16,
    io: DuplexStream,
    reply: oneshot::Sender<()>,
}

#[async_trait]
impl StreamRequest for PendingStream {
    fn port(&self) -> u16 {
        self.port
    }

    async fn accept(self: Box<Self>) -> Option<Arc<dyn ByteChannel>> {
        let PendingStream { io, reply, .. } = *self;
        reply.send(()).ok()?;
        Some(Arc::new(IoChannel::overlay(io, None)))
    }
}
