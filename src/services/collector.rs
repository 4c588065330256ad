//! Concurrent per-backend collection
//!
//! [`FanOutCollector`] issues every leg of one backend at once and applies
//! each payload to the sink as it arrives. One failing leg never aborts the
//! others; the [`CollectionVerdict`] reports how many succeeded.

use crate::error::CollectionError;
use crate::services::backends::{Backend, LegContext, LegSpec};
use crate::services::clock::Clock;
use crate::services::executor::{RequestExecutor, StatusClass, SubRequestOutcome};
use crate::services::session::BackendSession;
use crate::services::sink::{MetricScope, MetricSink};
use crate::services::transport::HttpTransport;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Summary of one backend's fan-out
#[derive(Debug, Clone)]
pub struct CollectionVerdict {
    pub backend: String,
    pub total: usize,
    pub succeeded: usize,
    pub auth_failures: usize,
    pub rate_limited: usize,
    /// The collection was cancelled before every leg finished
    pub cancelled: bool,
    /// Whether the session reused a cached credential for this collection
    pub login_cached: bool,
    pub elapsed: Duration,
    pub failures: Vec<CollectionError>,
}

impl CollectionVerdict {
    fn new(backend: &str, total: usize) -> Self {
        Self {
            backend: backend.to_string(),
            total,
            succeeded: 0,
            auth_failures: 0,
            rate_limited: 0,
            cancelled: false,
            login_cached: true,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.total - self.succeeded
    }

    /// Every leg succeeded and nothing was cancelled
    pub fn is_acceptable(&self) -> bool {
        !self.cancelled && self.succeeded == self.total
    }
}

/// Collects all legs of one backend
pub struct FanOutCollector {
    executor: RequestExecutor,
    legs: Vec<LegSpec>,
    sink: Arc<dyn MetricSink>,
    scope: MetricScope,
}

impl FanOutCollector {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricSink>,
    ) -> Result<Self, CollectionError> {
        let legs = backend.endpoints();
        if legs.is_empty() {
            return Err(CollectionError::Configuration(format!(
                "backend '{}' has no endpoints",
                backend.metric_category()
            )));
        }

        let scope = MetricScope::new(backend.metric_category(), transport.host());
        let session = Arc::new(BackendSession::new(backend, transport.clone(), clock));

        Ok(Self {
            executor: RequestExecutor::new(session, transport),
            legs,
            sink,
            scope,
        })
    }

    pub fn name(&self) -> &'static str {
        self.session().name()
    }

    pub fn session(&self) -> &Arc<BackendSession> {
        self.executor.session()
    }

    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }

    /// Authenticate, fan out and record the request-duration gauge.
    ///
    /// Authentication errors are returned before any leg is issued.
    pub async fn collect_backend(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CollectionVerdict, CollectionError> {
        let started = Instant::now();

        let login_cached = self.session().ensure_authenticated(cancel).await?;
        let mut verdict = self.collect(cancel).await;
        verdict.login_cached = login_cached;
        verdict.elapsed = started.elapsed();

        if !verdict.cancelled {
            self.record_duration(&verdict);
        }

        if verdict.is_acceptable() {
            tracing::debug!(
                backend = self.name(),
                legs = verdict.total,
                login_cached = verdict.login_cached,
                duration_ms = verdict.elapsed.as_millis() as u64,
                "Backend collection complete"
            );
        } else {
            tracing::warn!(
                backend = self.name(),
                succeeded = verdict.succeeded,
                total = verdict.total,
                cancelled = verdict.cancelled,
                "Backend collection incomplete"
            );
        }

        Ok(verdict)
    }

    /// Issue every leg concurrently and apply payloads as they complete
    pub async fn collect(&self, cancel: &CancellationToken) -> CollectionVerdict {
        let started = Instant::now();
        let mut verdict = CollectionVerdict::new(self.name(), self.legs.len());

        let mut pending: FuturesUnordered<_> = self
            .legs
            .iter()
            .map(|leg| async move { (leg, self.executor.execute(leg.path, cancel).await) })
            .collect();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    verdict.cancelled = true;
                    break;
                }
                next = pending.next() => next,
            };
            let Some((leg, outcome)) = next else {
                break;
            };
            self.record(leg, outcome, &mut verdict);
        }
        drop(pending);

        if verdict.cancelled {
            verdict.failures.push(CollectionError::Cancelled);
        }

        let session = self.session();
        if verdict.auth_failures > 0 && session.uses_auth_token() {
            session.invalidate();
        }
        if verdict.rate_limited > 0 && session.backoff_remaining().is_none() {
            session.activate_backoff();
        }

        verdict.elapsed = started.elapsed();
        verdict
    }

    fn record(&self, leg: &LegSpec, outcome: SubRequestOutcome, verdict: &mut CollectionVerdict) {
        match outcome.class {
            StatusClass::Ok => {
                let Some(payload) = outcome.payload.as_ref() else {
                    return;
                };
                let ctx = LegContext::new(self.sink.as_ref(), &self.scope, leg.name);
                match (leg.handler)(payload, &ctx) {
                    Ok(()) => verdict.succeeded += 1,
                    Err(e) => {
                        tracing::warn!(
                            backend = self.name(),
                            leg = leg.name,
                            error = %e,
                            "Failed to apply endpoint payload"
                        );
                        verdict.failures.push(CollectionError::UpstreamUnavailable {
                            backend: self.name().to_string(),
                            path: leg.path.to_string(),
                            reason: format!("unexpected payload: {:#}", e),
                        });
                    }
                }
            }
            StatusClass::Cancelled => verdict.cancelled = true,
            class => {
                match class {
                    StatusClass::AuthFailure => verdict.auth_failures += 1,
                    StatusClass::RateLimited => verdict.rate_limited += 1,
                    _ => {}
                }
                tracing::warn!(
                    backend = self.name(),
                    leg = leg.name,
                    path = %outcome.path,
                    status = ?outcome.status,
                    attempts = outcome.attempts,
                    detail = outcome.detail.as_deref().unwrap_or(""),
                    "Endpoint request failed"
                );
                verdict
                    .failures
                    .push(outcome.to_error(self.name(), self.session().policy().rate_limit_backoff));
            }
        }
    }

    /// Publish `request/duration_ms` for the matching `login_cached` value only
    fn record_duration(&self, verdict: &CollectionVerdict) {
        let millis = verdict.elapsed.as_secs_f64() * 1000.0;

        if !self.session().uses_auth_token() {
            self.sink.set(&self.scope, "request", "duration_ms", &[], millis);
            return;
        }

        let (current, other) = if verdict.login_cached {
            ("true", "false")
        } else {
            ("false", "true")
        };
        self.sink.set(
            &self.scope,
            "request",
            "duration_ms",
            &[("login_cached", current)],
            millis,
        );
        self.sink
            .remove(&self.scope, "request", "duration_ms", &[("login_cached", other)]);
    }
}
