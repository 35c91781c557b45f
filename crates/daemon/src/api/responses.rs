/// API Response types

use crate::proxy::ProxySnapshot;
use serde::Serialize;
use veilport_core::{DispatchSnapshot, ServiceState};

/// Status of one published hidden service
#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    /// Configured nickname
    pub nickname: String,
    /// The .veil hostname, once known
    pub address: Option<String>,
    pub state: ServiceState,
    /// Rendezvous and stream counters
    pub stats: DispatchSnapshot,
}

/// Service list response
#[derive(Debug, Serialize)]
pub struct ServiceListResponse {
    pub services: Vec<ServiceStatus>,
    /// Total number of services
    pub total: usize,
}

/// Local proxy status
#[derive(Debug, Serialize)]
pub struct ProxyStatusResponse {
    pub interface: String,
    pub port: u16,
    /// Number of accepted credential pairs
    pub credentials: usize,
    pub accepting: bool,
    pub stats: ProxySnapshot,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
