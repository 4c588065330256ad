//! Application routing
//!
//! This module defines all HTTP routes for the application.

use axum::{middleware, routing::get, Router};

use crate::api::{health, metrics};
use crate::middleware::logging::log_request;
use crate::server::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Probes for the orchestrator
    let health_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness))
        .route("/liveness", get(health::liveness));

    // `get` also answers HEAD
    Router::new()
        .route("/metrics", get(metrics::metrics))
        .merge(health_routes)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
