/// API Server implementation

use super::handlers::*;
use anyhow::Result;
use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Build the router with all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Hidden services
        .route("/api/services", get(list_services))
        .route("/api/services/:nickname", get(get_service))
        // Local proxy
        .route("/api/proxy", get(get_proxy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Status API of a running daemon
pub struct ApiServer {
    listen_addr: SocketAddr,
    state: AppState,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, state: AppState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("API server listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

        Ok(())
    }
}
