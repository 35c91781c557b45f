/// .veil hidden services
///
/// - Service addresses derived from service keys
/// - Port routing of inbound streams
/// - The dispatcher driving rendezvous and stream acceptance
/// - Deferred builders assembling all of the above

pub mod address;
pub mod callbacks;
pub mod conf;
pub mod dispatcher;
pub mod router;

pub use address::{ServiceAddress, ServiceAddressError};
pub use callbacks::{AcceptAll, CallbackSet, ServiceCallbacks};
pub use conf::{
    hidden_service_conf, service_config, service_key, HiddenServiceBuilder, HiddenServiceConf,
    ServiceConfigBuilder, ServiceKeyBuilder,
};
pub use dispatcher::{DispatchSnapshot, DispatchStats, HiddenService, ServiceError};
pub use router::{PortRange, PortRouteEntry, PortRouter, RouteError, RouteHandler, StreamCallback};
