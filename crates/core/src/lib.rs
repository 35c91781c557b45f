/// VeilPort core library
///
/// Provides:
/// - Service keys and `.veil` addresses
/// - The overlay engine traits with a loopback implementation
/// - Hidden service publishing with port routing
/// - Stream adapters and an outbound connector for HTTP stacks

pub mod client;
pub mod connector;
pub mod identity;
pub mod overlay;
pub mod service;
pub mod stream;

pub use client::{ClientBuilder, OverlayClient};
pub use connector::{
    connector_conf, extract_hostname, ConnectorBuilder, ConnectorConf, ConnectorError,
    OverlayConnector,
};
pub use identity::{generate_vanity, KeyError, ServiceKey};
pub use overlay::{
    ByteChannel, IoChannel, MemoryClient, MemoryNetwork, NetworkClient, OverlayError,
    RendezvousId, RendezvousRequest, ServiceConfig, ServiceHandle, ServiceState, StreamRequest,
    StreamSource,
};
pub use stream::OverlayStream;

// Re-export service types
pub use service::{
    hidden_service_conf, service_config, service_key, AcceptAll, CallbackSet, DispatchSnapshot,
    HiddenService, HiddenServiceBuilder, HiddenServiceConf, PortRange, PortRouter, RouteError,
    RouteHandler, ServiceAddress, ServiceCallbacks, ServiceConfigBuilder, ServiceError,
    ServiceKeyBuilder,
};
