//! Gateway backends
//!
//! Each supported gateway implements [`Backend`], a small capability set:
//! its metric category, whether it needs an auth token, how to obtain one,
//! and the fixed list of endpoints (legs) polled on every collection.
//!
//! # Example
//! ```ignore
//! let backend: Arc<dyn Backend> = Arc::new(EnphaseGateway::new());
//! for leg in backend.endpoints() {
//!     println!("{} -> {}", leg.name, leg.path);
//! }
//! ```

mod enphase;
mod tesla;

pub use enphase::EnphaseGateway;
pub use tesla::{TeslaCredentials, TeslaGateway};

use crate::services::sink::{MetricScope, MetricSink};
use crate::services::transport::{HttpTransport, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Legs
// ============================================================================

/// Applies one leg's JSON payload to the metric sink
pub type LegHandler = fn(&serde_json::Value, &LegContext<'_>) -> anyhow::Result<()>;

/// One independent sub-request of a backend's fan-out
#[derive(Clone, Copy)]
pub struct LegSpec {
    pub name: &'static str,
    pub path: &'static str,
    pub handler: LegHandler,
}

impl std::fmt::Debug for LegSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegSpec")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

/// What a [`LegHandler`] can write to
pub struct LegContext<'a> {
    sink: &'a dyn MetricSink,
    scope: &'a MetricScope,
    leg: &'a str,
}

impl<'a> LegContext<'a> {
    pub fn new(sink: &'a dyn MetricSink, scope: &'a MetricScope, leg: &'a str) -> Self {
        Self { sink, scope, leg }
    }

    /// Name of the leg being applied
    pub fn leg(&self) -> &str {
        self.leg
    }

    pub fn gauge(&self, sub_category: &str, metric: &str, value: f64) {
        self.sink.set(self.scope, sub_category, metric, &[], value);
    }

    pub fn labeled_gauge(&self, sub_category: &str, metric: &str, labels: &[(&str, &str)], value: f64) {
        self.sink.set(self.scope, sub_category, metric, labels, value);
    }
}

// ============================================================================
// Login
// ============================================================================

/// Why a login attempt did not produce a token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("login rate limited")]
    RateLimited,

    #[error("login returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed login response: {0}")]
    Malformed(String),

    #[error("login request failed: {0}")]
    Transport(TransportError),

    #[error("login cancelled")]
    Cancelled,

    #[error("backend does not use authentication")]
    Unsupported,
}

impl From<TransportError> for LoginError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Cancelled => LoginError::Cancelled,
            other => LoginError::Transport(other),
        }
    }
}

/// Credential freshness and backoff timings for one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// How long a successful freshness check is trusted before probing again
    pub login_check_interval: Duration,
    /// How long to fail fast after the backend answers 429
    pub rate_limit_backoff: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            login_check_interval: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_secs(15),
        }
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// Capability set of one gateway type
#[async_trait]
pub trait Backend: Send + Sync {
    /// Category used in metric names, e.g. `tesla_gateway`
    fn metric_category(&self) -> &'static str;

    /// Whether requests carry a bearer token obtained by [`Backend::fetch_credential`]
    fn uses_auth_token(&self) -> bool {
        false
    }

    /// Lightweight authenticated endpoint used to verify a token is still accepted
    fn probe_path(&self) -> Option<&'static str> {
        None
    }

    fn session_policy(&self) -> SessionPolicy {
        SessionPolicy::default()
    }

    /// Log in and return a fresh token
    async fn fetch_credential(
        &self,
        _transport: &dyn HttpTransport,
        _cancel: &CancellationToken,
    ) -> Result<String, LoginError> {
        Err(LoginError::Unsupported)
    }

    /// The fixed set of legs polled on every collection
    fn endpoints(&self) -> Vec<LegSpec>;
}

// ============================================================================
// Stub backend for tests
// ============================================================================
