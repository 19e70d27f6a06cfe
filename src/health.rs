//! HTTP health endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::task::JoinHandle;

use crate::cancellation::CancellationToken;
use crate::listener::{HealthMonitor, HealthStatus};

/// Shared state for the health routes.
#[derive(Clone)]
pub struct HealthState {
    pub monitor: Arc<HealthMonitor>,
    pub worker_name: String,
}

/// GET /health
///
/// 200 while healthy, 503 while starting or unhealthy.
async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let snapshot = state.monitor.snapshot();
    let code = match snapshot.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Starting | HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        code,
        Json(serde_json::json!({
            "service": state.worker_name,
            "status": snapshot.status,
            "worker_id": snapshot.worker_id,
            "protocol": snapshot.protocol,
            "heartbeat_enabled": snapshot.heartbeat_enabled,
            "heartbeat_misses": snapshot.heartbeat_misses,
            "last_heartbeat": snapshot.last_heartbeat,
        })),
    )
}

/// Build the health routes.
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

/// Bind the health port (0 picks a free port) without serving yet.
pub async fn bind_health(port: u16) -> std::io::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(("0.0.0.0", port)).await
}

/// Serve the health routes on `listener` until `shutdown` is cancelled.
pub fn serve_health(
    listener: tokio::net::TcpListener,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Health endpoint listening");

    let app = health_routes(state);
    let handle = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::warn!(error = %e, "Health endpoint stopped with an error");
        }
    });
    Ok((addr, handle))
}
