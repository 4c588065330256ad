//! Prometheus scrape endpoint
//!
//! GET /metrics (HEAD is routed here too)

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::server::state::AppState;

/// Refresh gateway metrics (or reuse a recent pass) and render the registry.
///
/// If the scraper disconnects, the handler future is dropped and the guard
/// cancels this request's wait; the shared collection keeps running.
pub async fn metrics(State(state): State<AppState>, method: Method) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    state.coordinator.collect_all(&cancel).await?;

    let cache_control = cache_control(state.coordinator.config().cache_ttl);

    if method == Method::HEAD {
        return Ok((StatusCode::OK, [(header::CACHE_CONTROL, cache_control)]).into_response());
    }

    let body = state
        .sink
        .encode()
        .map_err(|e| ApiError::Encoding(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, state.sink.content_type().to_string()),
            (header::CACHE_CONTROL, cache_control),
        ],
        body,
    )
        .into_response())
}

fn cache_control(ttl: Duration) -> String {
    if ttl.is_zero() {
        "no-store".to_string()
    } else {
        format!("max-age={}", ttl.as_secs())
    }
}
