//! Collection and API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the collection core.
///
/// The type is `Clone` because a single collection pass is shared by every
/// concurrent caller, and each of them receives the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// The login endpoint itself failed (non-2xx, malformed body, missing token,
    /// or a fresh token that the gateway refuses to honour).
    #[error("Authentication backend for {backend} unavailable: {reason}")]
    AuthBackendUnavailable { backend: String, reason: String },

    /// The backend is inside its backoff window, or just answered 429.
    #[error("{backend} is rate limiting requests, retry after {retry_after:?}")]
    RateLimited { backend: String, retry_after: Duration },

    /// A sub-request was still rejected after the reauthentication retry.
    #[error("{backend} rejected credentials for '{path}'")]
    AuthenticationFailure { backend: String, path: String },

    /// Network failure, timeout, or a non-auth non-2xx status on a sub-request.
    #[error("{backend} request to '{path}' failed: {reason}")]
    UpstreamUnavailable {
        backend: String,
        path: String,
        reason: String,
    },

    #[error("Collected {succeeded} of {total} endpoints")]
    PartialCollectionFailure { succeeded: usize, total: usize },

    #[error("Metrics collection cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CollectionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectionError::Cancelled)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, CollectionError::RateLimited { .. })
    }
}

/// Errors returned by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("Failed to encode metrics: {0}")]
    Encoding(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Collection(err) => match err {
                CollectionError::Cancelled => StatusCode::BAD_REQUEST,
                CollectionError::Configuration(_) | CollectionError::Internal(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                CollectionError::AuthBackendUnavailable { .. }
                | CollectionError::RateLimited { .. }
                | CollectionError::AuthenticationFailure { .. }
                | CollectionError::UpstreamUnavailable { .. }
                | CollectionError::PartialCollectionFailure { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            ApiError::Encoding(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Collection(CollectionError::Cancelled) => "Request cancelled".to_string(),
            other => other.to_string(),
        };

        let mut response = (status, Json(ErrorResponse { error: message })).into_response();

        if let ApiError::Collection(CollectionError::RateLimited { retry_after, .. }) = &self {
            let seconds = retry_after.as_secs().max(1);
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
