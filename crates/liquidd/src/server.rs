//! HTTP surface: Prometheus scrape, health probe, endpoint listing.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

use liquid_metrics::render_prometheus;
use liquid_runtime::{ContainerPool, PoolStats};

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<ContainerPool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub pool: PoolStats,
    pub healthy_endpoints: usize,
    pub total_endpoints: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/healthz", get(healthz))
        .route("/endpoints", get(list_endpoints))
        .with_state(state)
}

/// GET /metrics
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = render_prometheus(&state.pool.metrics_snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// GET /healthz. 503 once shut down or when the placement kind has no
/// healthy endpoint left to choose.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let endpoints = state.pool.scheduler().get_metrics();
    let status = if state.pool.is_shut_down() {
        "shutting_down"
    } else if endpoints.placeable_endpoints == 0 {
        "degraded"
    } else {
        "ok"
    };
    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthReport {
            status,
            pool: state.pool.stats(),
            healthy_endpoints: endpoints.placeable_endpoints,
            total_endpoints: endpoints.total_endpoints,
        }),
    )
}

/// GET /endpoints
async fn list_endpoints(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.scheduler().endpoints())
}
