use crate::auth::Credentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Local proxy constants
pub mod proxy {
    /// Interface the proxy binds to when none is configured
    pub const DEFAULT_INTERFACE: &str = "localhost";

    /// Delay between the first termination signal and tearing a session down
    pub const TEARDOWN_GRACE_MS: u64 = 100;

    /// Length of generated usernames
    pub const GENERATED_USER_LEN: usize = 12;

    /// Length of generated passwords
    pub const GENERATED_PASS_LEN: usize = 24;

    /// Bytes buffered from a client while its outbound channel is opening
    pub const MAX_PREBUFFER_BYTES: usize = 1024 * 1024;

    /// Time allowed for the SOCKS5 negotiation
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
}

/// Overlay stream constants
pub mod stream {
    /// Chunk size used when pumping bytes between endpoints
    pub const READ_CHUNK_SIZE: usize = 8192;

    /// Capacity of in-process overlay pipes
    pub const PIPE_CAPACITY: usize = 64 * 1024;
}

/// Hidden service constants
pub mod service {
    /// Hostname suffix of published endpoints
    pub const ADDRESS_SUFFIX: &str = ".veil";

    /// Vanity key search yields to the scheduler every this many attempts
    pub const VANITY_YIELD_EVERY: u64 = 1000;

    /// How long the daemon waits for a service to come up
    pub const STARTUP_TIMEOUT_SECS: u64 = 30;
}

/// Status API constants
pub mod api {
    /// Default listen address of the status API
    pub const DEFAULT_API_ADDR: &str = "127.0.0.1:9150";
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,

    /// Status API listen address, disabled when absent
    pub api_addr: Option<String>,

    /// Overlay engine settings
    pub overlay: OverlayConfig,

    /// Local SOCKS5 proxy
    pub proxy: ProxyConfig,

    /// Hidden services to publish
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Let non-overlay hostnames leave as plain TCP connections
    pub allow_clearnet_exit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enabled: bool,

    pub interface: String,

    /// Fixed port; an ephemeral one is picked when absent
    pub port: Option<u16>,

    pub auths: Vec<Credentials>,

    /// Generate one random pair when `auths` is empty
    pub generate_auth: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: proxy::DEFAULT_INTERFACE.to_string(),
            port: None,
            auths: Vec::new(),
            generate_auth: true,
        }
    }
}

/// One published hidden service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEntry {
    pub nickname: String,

    /// Hex encoded 32 byte secret; a fresh key is generated when absent
    pub secret_key_hex: Option<String>,

    pub routes: Vec<RouteEntry>,
}

/// Port specifier forwarded to a local listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// `*`, `<port>` or `<port>-<port>`
    pub ports: String,

    /// Local `host:port` receiving the streams
    pub forward: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            api_addr: Some(api::DEFAULT_API_ADDR.to_string()),
            overlay: OverlayConfig::default(),
            proxy: ProxyConfig::default(),
            services: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy.port = Some(port);
        self
    }

    pub fn with_auth(mut self, auth: Credentials) -> Self {
        self.proxy.auths.push(auth);
        self
    }

    pub fn with_service(mut self, service: ServiceEntry) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_clearnet_exit(mut self, allow: bool) -> Self {
        self.overlay.allow_clearnet_exit = allow;
        self
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(proxy::TEARDOWN_GRACE_MS)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(proxy::HANDSHAKE_TIMEOUT_SECS)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(service::STARTUP_TIMEOUT_SECS)
    }

    /// Reject configurations the daemon could never start
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, service) in self.services.iter().enumerate() {
            if service.nickname.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service #{} has no nickname",
                    index
                )));
            }
            if self
                .services
                .iter()
                .filter(|other| other.nickname == service.nickname)
                .count()
                > 1
            {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service nickname {:?}",
                    service.nickname
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
