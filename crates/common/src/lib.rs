/// Shared building blocks for VeilPort
///
/// Error umbrella, daemon configuration, proxy credentials and the deferred
/// builders used to assemble hidden services and proxies.

pub mod auth;
pub mod config;
pub mod error;
pub mod fluent;

pub use auth::{find_matching, generate_token, Credentials};
pub use config::{
    ConfigError, DaemonConfig, OverlayConfig, ProxyConfig, RouteEntry, ServiceEntry,
};
pub use error::{Result, VeilPortError};
pub use fluent::{BoxFuture, Fluent, MaybeFluent};
