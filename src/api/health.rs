//! Health check endpoints
//!
//! This module provides health check endpoints for monitoring
//! and container orchestration (Kubernetes, Docker, etc.)

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::server::state::AppState;

/// Response for the main health check endpoint
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub uptime_seconds: u64,
    pub backends: Vec<&'static str>,
}

/// Response for readiness probe
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for liveness probe
#[derive(Serialize)]
pub struct LivenessResponse {
    pub alive: bool,
}

/// Main health check endpoint
///
/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.settings.app_version.clone(),
        environment: state.settings.environment.to_string(),
        uptime_seconds: state.uptime_seconds(),
        backends: state.coordinator.backends(),
    })
}

/// Readiness probe endpoint
///
/// Ready means the gateways can currently be collected from. Goes through
/// the coordinator, so a recent successful scrape answers without I/O.
///
/// GET /ready
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.coordinator.collect_all(&cancel).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Service not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    ready: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Liveness probe endpoint
///
/// GET /liveness
pub async fn liveness() -> Json<LivenessResponse> {
    // If we can respond, we're alive
    Json(LivenessResponse { alive: true })
}
