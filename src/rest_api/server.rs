//! Axum HTTP server for the health surface

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::runtime::InformerFactory;
use crate::{Error, Result};

use super::handlers;

/// What `/ready` reports on
#[derive(Clone)]
pub struct HealthState {
    pub is_leader: Arc<AtomicBool>,
    /// Unset until the controllers are wired
    pub informers: Option<Arc<InformerFactory>>,
}

impl HealthState {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    pub fn caches_synced(&self) -> bool {
        self.informers.as_ref().is_some_and(|f| f.has_synced())
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the health surface on `port` until `token` fires
pub async fn run_server(state: Arc<HealthState>, port: u16, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Health server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))
}
