/// VeilPort daemon library
///
/// This crate provides the local SOCKS5 bridge into the overlay, the status
/// API and the runner wiring configured hidden services and the proxy.

pub mod api;
pub mod proxy;
pub mod runner;

pub use api::{ApiServer, AppState};
pub use proxy::{proxy_conf, ProxyBridge, ProxyBuilder, ProxyConf, ProxyError, ProxySnapshot};
pub use runner::Daemon;
