/// API request handlers

use super::responses::*;
use crate::proxy::ProxyBridge;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, warn};
use veilport_core::HiddenService;

/// Shared application state
#[derive(Clone, Default)]
pub struct AppState {
    pub services: Arc<Vec<(String, Arc<HiddenService>)>>,
    pub proxy: Option<Arc<ProxyBridge>>,
}

impl AppState {
    pub fn new(services: Vec<(String, Arc<HiddenService>)>, proxy: Option<Arc<ProxyBridge>>) -> Self {
        Self {
            services: Arc::new(services),
            proxy,
        }
    }
}

fn service_status(nickname: &str, service: &HiddenService) -> ServiceStatus {
    ServiceStatus {
        nickname: nickname.to_string(),
        address: service.address().map(|a| a.to_hostname()),
        state: service.state(),
        stats: service.stats(),
    }
}

/// Handler for GET /api/services
pub async fn list_services(State(state): State<AppState>) -> Json<ServiceListResponse> {
    debug!("API: GET /api/services");

    let services: Vec<_> = state
        .services
        .iter()
        .map(|(nickname, service)| service_status(nickname, service))
        .collect();

    Json(ServiceListResponse {
        total: services.len(),
        services,
    })
}

/// Handler for GET /api/services/:nickname
pub async fn get_service(
    State(state): State<AppState>,
    Path(nickname): Path<String>,
) -> Result<Json<ServiceStatus>, AppError> {
    debug!("API: GET /api/services/{}", nickname);

    state
        .services
        .iter()
        .find(|(name, _)| *name == nickname)
        .map(|(name, service)| Json(service_status(name, service)))
        .ok_or_else(|| AppError::not_found(format!("No service named {:?}", nickname)))
}

/// Handler for GET /api/proxy
pub async fn get_proxy(State(state): State<AppState>) -> Result<Json<ProxyStatusResponse>, AppError> {
    debug!("API: GET /api/proxy");

    let proxy = state
        .proxy
        .as_ref()
        .ok_or_else(|| AppError::not_found("Proxy is disabled"))?;

    Ok(Json(ProxyStatusResponse {
        interface: proxy.interface().to_string(),
        port: proxy.port(),
        credentials: proxy.credentials().len(),
        accepting: proxy.is_accepting(),
        stats: proxy.stats(),
    }))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(
            self.message,
            self.status_code.as_u16(),
        ));

        (self.status_code, body).into_response()
    }
}
