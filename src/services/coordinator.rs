//! Single-flight, TTL-cached collection across all backends
//!
//! Scrapes arrive from several Prometheus servers at once. The coordinator
//! makes sure at most one collection pass runs at a time, that concurrent
//! callers share its outcome, and that a successful pass is reused for the
//! configured TTL. Failed passes are never cached.
//!
//! A pass runs on its own task: a caller giving up (or every caller giving
//! up) does not abort it, so the next scrape can still benefit from it.

use crate::error::CollectionError;
use crate::services::clock::Clock;
use crate::services::collector::{CollectionVerdict, FanOutCollector};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

type SharedRun = Shared<BoxFuture<'static, Result<(), CollectionError>>>;

/// Timing knobs for [`CollectionCoordinator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long a successful pass is reused; zero disables caching
    pub cache_ttl: Duration,
    /// Upper bound on one pass, and on how long a caller waits for it
    pub max_collection_duration: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            max_collection_duration: Duration::from_secs(5),
        }
    }
}

enum Slot {
    Idle,
    Pending(SharedRun),
    Cached { expires_at: Instant },
}

struct Inner {
    collectors: Vec<Arc<FanOutCollector>>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    slot: Mutex<Slot>,
    runs_started: AtomicU64,
    shutdown: CancellationToken,
}

/// Entry point for `CollectAll`; cheap to clone
#[derive(Clone)]
pub struct CollectionCoordinator {
    inner: Arc<Inner>,
}

impl CollectionCoordinator {
    pub fn new(
        collectors: Vec<FanOutCollector>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                collectors: collectors.into_iter().map(Arc::new).collect(),
                clock,
                config,
                slot: Mutex::new(Slot::Idle),
                runs_started: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.inner.config
    }

    /// Names of the configured backends
    pub fn backends(&self) -> Vec<&'static str> {
        self.inner.collectors.iter().map(|c| c.name()).collect()
    }

    /// Refresh every backend's metrics, or reuse a recent successful pass.
    ///
    /// Returns `Cancelled` when `cancel` fires or the pass exceeds the
    /// maximum collection duration; the pass itself keeps running.
    pub async fn collect_all(&self, cancel: &CancellationToken) -> Result<(), CollectionError> {
        let run = {
            let mut slot = self.inner.lock_slot();
            match &*slot {
                Slot::Cached { expires_at } if self.inner.clock.now() < *expires_at => {
                    tracing::debug!("Serving cached collection");
                    return Ok(());
                }
                Slot::Pending(run) => {
                    tracing::debug!("Joining in-flight collection");
                    run.clone()
                }
                _ => {
                    let run = self.start_run();
                    *slot = Slot::Pending(run.clone());
                    run
                }
            }
        };

        tokio::select! {
            result = run => result,
            _ = cancel.cancelled() => {
                tracing::debug!("Caller cancelled while waiting for collection");
                Err(CollectionError::Cancelled)
            }
            _ = tokio::time::sleep(self.inner.config.max_collection_duration) => {
                tracing::warn!(
                    timeout_secs = self.inner.config.max_collection_duration.as_secs(),
                    "Gave up waiting for metrics collection"
                );
                Err(CollectionError::Cancelled)
            }
        }
    }

    /// When the cached pass expires, if one is cached
    pub fn cached_until(&self) -> Option<Instant> {
        match &*self.inner.lock_slot() {
            Slot::Cached { expires_at } => Some(*expires_at),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.lock_slot(), Slot::Pending(_))
    }

    pub fn runs_started(&self) -> u64 {
        self.inner.runs_started.load(Ordering::SeqCst)
    }

    /// Abort any in-flight pass; used on server shutdown
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn start_run(&self) -> SharedRun {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = match AssertUnwindSafe(inner.run()).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(CollectionError::Internal(
                    "metrics collection panicked".to_string(),
                )),
            };
            inner.finish(&result);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(CollectionError::Internal(format!(
                    "metrics collection task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(&self) -> Result<(), CollectionError> {
        let run_id = self.runs_started.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let cancel = self.shutdown.child_token();

        let passes = join_all(self.collectors.iter().map(|c| c.collect_backend(&cancel)));
        let results = match tokio::time::timeout(self.config.max_collection_duration, passes).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    run_id,
                    timeout_secs = self.config.max_collection_duration.as_secs(),
                    "Cancelling metrics collection due to timeout"
                );
                return Err(CollectionError::Cancelled);
            }
        };

        let outcome = summarize(self.collectors.iter().map(|c| c.leg_count()).zip(results));
        match &outcome {
            Ok(()) => tracing::info!(
                run_id,
                backends = self.collectors.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Metrics collection complete"
            ),
            Err(e) => tracing::warn!(
                run_id,
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "Metrics collection failed"
            ),
        }
        outcome
    }

    /// Leave the pending state; only successes are cached
    fn finish(&self, result: &Result<(), CollectionError>) {
        let mut slot = self.lock_slot();
        *slot = match result {
            Ok(()) if !self.config.cache_ttl.is_zero() => Slot::Cached {
                expires_at: self.clock.now() + self.config.cache_ttl,
            },
            _ => Slot::Idle,
        };
    }
}

/// Reduce per-backend results to one outcome.
///
/// Cancellation wins, then rate limiting, then login failures; anything
/// else is reported as a partial collection. A backend that failed before
/// issuing its legs counts all of them as failed.
fn summarize<I>(results: I) -> Result<(), CollectionError>
where
    I: IntoIterator<Item = (usize, Result<CollectionVerdict, CollectionError>)>,
{
    let mut total = 0;
    let mut succeeded = 0;
    let mut cancelled = false;
    let mut rate_limited = None;
    let mut login_failed = None;

    let mut note = |err: CollectionError| match err {
        CollectionError::Cancelled => cancelled = true,
        CollectionError::RateLimited { .. } => {
            rate_limited.get_or_insert(err);
        }
        CollectionError::AuthBackendUnavailable { .. } => {
            login_failed.get_or_insert(err);
        }
        _ => {}
    };

    for (leg_count, result) in results {
        match result {
            Ok(verdict) => {
                total += verdict.total;
                succeeded += verdict.succeeded;
                if verdict.cancelled {
                    note(CollectionError::Cancelled);
                }
                verdict.failures.into_iter().for_each(&mut note);
            }
            Err(err) => {
                total += leg_count;
                note(err);
            }
        }
    }

    if cancelled {
        return Err(CollectionError::Cancelled);
    }
    if succeeded == total {
        return Ok(());
    }
    if let Some(err) = rate_limited.or(login_failed) {
        return Err(err);
    }
    Err(CollectionError::PartialCollectionFailure { succeeded, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backends::testing::{StubBackend, LOGIN_PATH};
    use crate::services::clock::ManualClock;
    use crate::services::sink::testing::RecordingSink;
    use crate::services::transport::testing::ScriptedTransport;
    use crate::services::transport::HttpResponse;

    fn ok_legs() -> ScriptedTransport {
        ScriptedTransport::new(|_| Ok(HttpResponse::new(200, r#"{"value": 1}"#)))
    }

    fn coordinator(
        backend: StubBackend,
        transport: &Arc<ScriptedTransport>,
        clock: &Arc<ManualClock>,
        config: CoordinatorConfig,
    ) -> CollectionCoordinator {
        let collector = FanOutCollector::new(
            Arc::new(backend),
            transport.clone(),
            clock.clone(),
            Arc::new(RecordingSink::new()),
        )
        .unwrap();
        CollectionCoordinator::new(vec![collector], clock.clone(), config)
    }

    fn config(ttl_secs: u64, max_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            cache_ttl: Duration::from_secs(ttl_secs),
            max_collection_duration: Duration::from_millis(max_ms),
        }
    }

    async fn wait_until_idle(coordinator: &CollectionCoordinator) {
        for _ in 0..100 {
            if !coordinator.is_pending() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("collection never finished");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let transport = Arc::new(ok_legs().with_delay(Duration::from_millis(30)));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 2000));
        let cancel = CancellationToken::new();

        let callers = (0..8).map(|_| coordinator.collect_all(&cancel));
        let results = join_all(callers).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(coordinator.runs_started(), 1);
        assert_eq!(transport.total(), 2);
    }

    #[tokio::test]
    async fn test_success_is_cached_until_ttl() {
        let transport = Arc::new(ok_legs());
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 2000));
        let cancel = CancellationToken::new();

        coordinator.collect_all(&cancel).await.unwrap();
        assert!(coordinator.cached_until().is_some());

        clock.advance(Duration::from_secs(4));
        coordinator.collect_all(&cancel).await.unwrap();
        assert_eq!(transport.total(), 2);

        clock.advance(Duration::from_secs(1));
        coordinator.collect_all(&cancel).await.unwrap();
        assert_eq!(transport.total(), 4);
        assert_eq!(coordinator.runs_started(), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let transport = Arc::new(ok_legs());
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(1), &transport, &clock, config(0, 2000));
        let cancel = CancellationToken::new();

        coordinator.collect_all(&cancel).await.unwrap();
        coordinator.collect_all(&cancel).await.unwrap();

        assert_eq!(coordinator.runs_started(), 2);
        assert!(coordinator.cached_until().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let transport = Arc::new(ScriptedTransport::new(|request| match request.path.as_str() {
            "/leg2" => Ok(HttpResponse::new(500, "")),
            _ => Ok(HttpResponse::new(200, r#"{"value": 1}"#)),
        }));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 2000));
        let cancel = CancellationToken::new();

        let err = coordinator.collect_all(&cancel).await.unwrap_err();
        assert_eq!(
            err,
            CollectionError::PartialCollectionFailure {
                succeeded: 1,
                total: 2
            }
        );
        assert!(coordinator.cached_until().is_none());

        coordinator.collect_all(&cancel).await.unwrap_err();
        assert_eq!(coordinator.runs_started(), 2);
    }

    #[tokio::test]
    async fn test_run_survives_cancelled_caller() {
        let transport = Arc::new(ok_legs().with_delay(Duration::from_millis(100)));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 2000));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = coordinator.collect_all(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(coordinator.is_pending());
        assert!(coordinator.cached_until().is_none());

        wait_until_idle(&coordinator).await;
        assert!(coordinator.cached_until().is_some());

        coordinator.collect_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(coordinator.runs_started(), 1);
        assert_eq!(transport.total(), 2);
    }

    #[tokio::test]
    async fn test_collection_deadline() {
        let transport = Arc::new(ok_legs().hanging_on("/leg1"));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 50));

        let err = coordinator
            .collect_all(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        wait_until_idle(&coordinator).await;
        assert!(coordinator.cached_until().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_run() {
        let transport = Arc::new(ok_legs().hanging_on("/leg1"));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(StubBackend::new(2), &transport, &clock, config(5, 5000));

        let stopper = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.shutdown();
        });

        let err = coordinator
            .collect_all(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        wait_until_idle(&coordinator).await;
        assert!(coordinator.cached_until().is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_login_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(HttpResponse::new(429, ""))));
        let clock = Arc::new(ManualClock::new());
        let coordinator = coordinator(
            StubBackend::new(2).with_auth(),
            &transport,
            &clock,
            config(5, 2000),
        );
        let cancel = CancellationToken::new();

        assert!(coordinator.collect_all(&cancel).await.unwrap_err().is_rate_limited());
        assert!(coordinator.collect_all(&cancel).await.unwrap_err().is_rate_limited());
        assert_eq!(transport.count(LOGIN_PATH), 1);
        assert_eq!(transport.total(), 1);
    }

    #[tokio::test]
    async fn test_no_backends_is_a_no_op() {
        let coordinator = CollectionCoordinator::new(
            Vec::new(),
            Arc::new(ManualClock::new()),
            CoordinatorConfig::default(),
        );
        coordinator.collect_all(&CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn test_summarize_precedence() {
        let verdict = |succeeded: usize, failures: Vec<CollectionError>| CollectionVerdict {
            backend: "stub".into(),
            total: 2,
            succeeded,
            auth_failures: 0,
            rate_limited: 0,
            cancelled: false,
            login_cached: true,
            elapsed: Duration::ZERO,
            failures,
        };
        let limited = CollectionError::RateLimited {
            backend: "a".into(),
            retry_after: Duration::from_secs(15),
        };
        let login = CollectionError::AuthBackendUnavailable {
            backend: "b".into(),
            reason: "500".into(),
        };

        assert_eq!(summarize(vec![(2, Ok(verdict(2, vec![])))]), Ok(()));
        assert_eq!(
            summarize(vec![(2, Err(login.clone())), (2, Ok(verdict(1, vec![limited.clone()])))]),
            Err(limited)
        );
        assert_eq!(
            summarize(vec![(2, Err(login.clone())), (2, Ok(verdict(2, vec![])))]),
            Err(login.clone())
        );
        assert_eq!(
            summarize(vec![(2, Err(login)), (2, Err(CollectionError::Cancelled))]),
            Err(CollectionError::Cancelled)
        );
        assert_eq!(
            summarize(vec![(3, Ok(verdict(1, vec![])))]),
            Err(CollectionError::PartialCollectionFailure {
                succeeded: 1,
                total: 2
            })
        );
    }
}
