use axum::{extract::State, routing::get, Json, Router};
use registrar_common::{HealthCheck, HealthStatusCode};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Source of the status reported by `GET /health`.
pub trait HealthIndicator: Send + Sync + 'static {
    fn health(&self) -> HealthCheck;
}

/// Reports UP unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysUp;

impl HealthIndicator for AlwaysUp {
    fn health(&self) -> HealthCheck {
        HealthCheck::new(HealthStatusCode::Up, "service is running")
    }
}

#[derive(Clone)]
struct AppState {
    indicator: Arc<dyn HealthIndicator>,
}

pub fn router(indicator: Arc<dyn HealthIndicator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { indicator })
}

/// Serves the health router until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    indicator: Arc<dyn HealthIndicator>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoint listening");
    }
    axum::serve(listener, router(indicator))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health(State(state): State<AppState>) -> Json<HealthCheck> {
    Json(state.indicator.health())
}
