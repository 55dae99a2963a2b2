//! HTTP API for health and readiness probes

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use wharf_core::{ProxyManager, RuntimeRegistry, UpdateScheduler};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RuntimeRegistry>,
    pub scheduler: Arc<UpdateScheduler>,
    pub proxy: Arc<ProxyManager>,
}

impl AppState {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        scheduler: Arc<UpdateScheduler>,
        proxy: Arc<ProxyManager>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            proxy,
        }
    }
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    engines: Vec<String>,
    scheduler_armed: bool,
    proxy_enabled: bool,
}

/// Health check - 200 with a summary while at least one engine is registered
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut engines: Vec<String> = state.registry.all().into_keys().collect();
    engines.sort();

    let report = HealthReport {
        status: if engines.is_empty() { "degraded" } else { "ok" },
        engines,
        scheduler_armed: state.scheduler.is_armed().await,
        proxy_enabled: state.proxy.is_enabled().await,
    };
    let status_code = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(report))
}

#[derive(Serialize)]
struct ReadinessReport {
    ready: bool,
}

/// Readiness check - 200 once a runtime backend answers
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = !state.registry.is_empty();
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(ReadinessReport { ready }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
