//! Per-backend authentication session
//!
//! A [`BackendSession`] owns one gateway's credential lifecycle:
//! - the cached bearer token, readable without waiting on a refresh
//! - periodic freshness probes against an authenticated endpoint
//! - a single-writer refresh section (double-checked under an async mutex)
//! - the rate-limit backoff window entered after a 429

use crate::error::CollectionError;
use crate::services::backends::{Backend, LoginError, SessionPolicy};
use crate::services::clock::Clock;
use crate::services::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Credential
// ============================================================================

/// An opaque bearer token and the moment it was obtained.
///
/// Replaced wholesale on refresh; never mutated.
pub struct Credential {
    token: String,
    obtained_at: Instant,
}

impl Credential {
    pub fn new(token: impl Into<String>, obtained_at: Instant) -> Self {
        Self {
            token: token.into(),
            obtained_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn obtained_at(&self) -> Instant {
        self.obtained_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug, Default)]
struct SessionState {
    /// Last time the cached credential was confirmed (login or probe)
    last_checked: Option<Instant>,
    /// Calls fail fast until this instant
    backoff_until: Option<Instant>,
}

enum Freshness {
    Fresh,
    /// Needs a login; carries the credential that was judged stale, if any
    Stale(Option<Arc<Credential>>),
}

// ============================================================================
// Backend session
// ============================================================================

/// Authentication lifecycle for one backend
pub struct BackendSession {
    name: &'static str,
    backend: Arc<dyn Backend>,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
    credential: RwLock<Option<Arc<Credential>>>,
    state: Mutex<SessionState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl BackendSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: backend.metric_category(),
            policy: backend.session_policy(),
            backend,
            transport,
            clock,
            credential: RwLock::new(None),
            state: Mutex::new(SessionState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn uses_auth_token(&self) -> bool {
        self.backend.uses_auth_token()
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// The credential to attach to outgoing requests, if any
    pub fn current_credential(&self) -> Option<Arc<Credential>> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the cached credential so the next [`ensure_authenticated`] logs in
    ///
    /// [`ensure_authenticated`]: BackendSession::ensure_authenticated
    pub fn invalidate(&self) {
        let previous = self
            .credential
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            tracing::debug!(backend = self.name, "Credential invalidated");
        }
    }

    /// Drop the cached credential only if it is still `rejected`.
    ///
    /// Returns false when a concurrent caller already replaced it.
    pub fn invalidate_credential(&self, rejected: &Arc<Credential>) -> bool {
        let mut slot = self.credential.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, rejected) => {
                let age = self.clock.now().saturating_duration_since(current.obtained_at());
                *slot = None;
                tracing::debug!(
                    backend = self.name,
                    age_secs = age.as_secs(),
                    "Rejected credential invalidated"
                );
                true
            }
            _ => false,
        }
    }

    /// Remaining time in the backoff window, if one is active
    pub fn backoff_remaining(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock_state()
            .backoff_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// Enter the backoff window after the backend signalled rate limiting
    pub fn activate_backoff(&self) -> CollectionError {
        let until = self.clock.now() + self.policy.rate_limit_backoff;
        self.lock_state().backoff_until = Some(until);
        tracing::warn!(
            backend = self.name,
            backoff_secs = self.policy.rate_limit_backoff.as_secs(),
            "Backend rate limited, backing off"
        );
        CollectionError::RateLimited {
            backend: self.name.to_string(),
            retry_after: self.policy.rate_limit_backoff,
        }
    }

    /// Make sure a usable credential is cached.
    ///
    /// Returns `Ok(true)` when an existing credential was reused and
    /// `Ok(false)` when this call performed a fresh login.
    pub async fn ensure_authenticated(
        &self,
        cancel: &CancellationToken,
    ) -> Result<bool, CollectionError> {
        self.check_backoff()?;

        if !self.backend.uses_auth_token() {
            return Ok(true);
        }

        let stale = match self.freshness(cancel).await? {
            Freshness::Fresh => return Ok(true),
            Freshness::Stale(observed) => observed,
        };

        let _guard = tokio::select! {
            guard = self.refresh_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(CollectionError::Cancelled),
        };

        // The holder before us may have refreshed or hit a rate limit
        self.check_backoff()?;
        let current = self.current_credential();
        let replaced = match (&stale, &current) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
        };
        if replaced {
            tracing::debug!(backend = self.name, "Credential refreshed by a concurrent caller");
            return Ok(true);
        }

        self.login(cancel).await?;
        Ok(false)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_backoff(&self) -> Result<(), CollectionError> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        match state.backoff_until {
            Some(until) if now < until => Err(CollectionError::RateLimited {
                backend: self.name.to_string(),
                retry_after: until - now,
            }),
            Some(_) => {
                state.backoff_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn freshness(&self, cancel: &CancellationToken) -> Result<Freshness, CollectionError> {
        let Some(credential) = self.current_credential() else {
            return Ok(Freshness::Stale(None));
        };

        let now = self.clock.now();
        let due = self.lock_state().last_checked.map_or(true, |checked| {
            now.saturating_duration_since(checked) >= self.policy.login_check_interval
        });
        if !due {
            return Ok(Freshness::Fresh);
        }

        let Some(probe_path) = self.backend.probe_path() else {
            return Ok(Freshness::Fresh);
        };

        match self.probe(probe_path, &credential, cancel).await {
            Ok(response) if response.is_success() => {
                self.lock_state().last_checked = Some(self.clock.now());
                Ok(Freshness::Fresh)
            }
            Ok(response) if response.is_auth_failure() => {
                tracing::info!(
                    backend = self.name,
                    status = response.status,
                    "Cached credential no longer accepted"
                );
                Ok(Freshness::Stale(Some(credential)))
            }
            Ok(response) if response.is_rate_limited() => Err(self.activate_backoff()),
            Ok(response) => {
                tracing::warn!(
                    backend = self.name,
                    status = response.status,
                    "Freshness probe inconclusive, keeping cached credential"
                );
                Ok(Freshness::Fresh)
            }
            Err(TransportError::Cancelled) => Err(CollectionError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    backend = self.name,
                    error = %err,
                    "Freshness probe failed, keeping cached credential"
                );
                Ok(Freshness::Fresh)
            }
        }
    }

    async fn probe(
        &self,
        path: &str,
        credential: &Credential,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.transport
            .send(HttpRequest::get(path).with_bearer(credential.token()), cancel)
            .await
    }

    async fn login(&self, cancel: &CancellationToken) -> Result<(), CollectionError> {
        tracing::info!(backend = self.name, "Logging in to gateway");

        let token = match self.backend.fetch_credential(self.transport.as_ref(), cancel).await {
            Ok(token) => token,
            Err(LoginError::RateLimited) => return Err(self.activate_backoff()),
            Err(LoginError::Cancelled) => return Err(CollectionError::Cancelled),
            Err(err) => {
                tracing::error!(backend = self.name, error = %err, "Login failed");
                return Err(self.unavailable(err.to_string()));
            }
        };
        let credential = Arc::new(Credential::new(token, self.clock.now()));

        // A token that does not authorize calls must never be cached
        if let Some(probe_path) = self.backend.probe_path() {
            match self.probe(probe_path, &credential, cancel).await {
                Ok(response) if response.is_success() => {}
                Ok(response) if response.is_rate_limited() => return Err(self.activate_backoff()),
                Ok(response) => {
                    return Err(self.unavailable(format!(
                        "new credential rejected by '{}' with status {}",
                        probe_path, response.status
                    )))
                }
                Err(TransportError::Cancelled) => return Err(CollectionError::Cancelled),
                Err(err) => {
                    return Err(self.unavailable(format!(
                        "could not validate new credential: {}",
                        err
                    )))
                }
            }
        }

        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        self.lock_state().last_checked = Some(self.clock.now());
        tracing::debug!(backend = self.name, "Fetched new credential");

        Ok(())
    }

    fn unavailable(&self, reason: String) -> CollectionError {
        CollectionError::AuthBackendUnavailable {
            backend: self.name.to_string(),
            reason,
        }
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("has_credential", &self.current_credential().is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
