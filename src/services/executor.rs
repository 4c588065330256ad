//! Single sub-request execution with one re-authentication retry
//!
//! A 401 or 403 on an authenticated backend means the cached token was
//! revoked between the freshness check and the call. The executor drops that
//! token, re-authenticates through the session and retries exactly once.

use crate::error::CollectionError;
use crate::services::session::BackendSession;
use crate::services::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classification of a finished sub-request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    AuthFailure,
    RateLimited,
    OtherFailure,
    Cancelled,
}

/// Result of one sub-request, including any retry
#[derive(Debug, Clone)]
pub struct SubRequestOutcome {
    pub path: String,
    pub class: StatusClass,
    /// Last HTTP status received, if any
    pub status: Option<u16>,
    /// Parsed body, present only when `class` is `Ok`
    pub payload: Option<Value>,
    pub attempts: u32,
    pub detail: Option<String>,
}

impl SubRequestOutcome {
    fn new(path: &str, class: StatusClass, attempts: u32) -> Self {
        Self {
            path: path.to_string(),
            class,
            status: None,
            payload: None,
            attempts,
            detail: None,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.class == StatusClass::Ok
    }

    /// The error this outcome contributes to a collection verdict
    pub fn to_error(&self, backend: &str, retry_after: Duration) -> CollectionError {
        let reason = || match (&self.detail, self.status) {
            (Some(detail), _) => detail.clone(),
            (None, Some(status)) => format!("status {}", status),
            (None, None) => "no response".to_string(),
        };
        match self.class {
            StatusClass::Cancelled => CollectionError::Cancelled,
            StatusClass::AuthFailure => CollectionError::AuthenticationFailure {
                backend: backend.to_string(),
                path: self.path.clone(),
            },
            StatusClass::RateLimited => CollectionError::RateLimited {
                backend: backend.to_string(),
                retry_after,
            },
            StatusClass::OtherFailure => CollectionError::UpstreamUnavailable {
                backend: backend.to_string(),
                path: self.path.clone(),
                reason: reason(),
            },
            StatusClass::Ok => CollectionError::Internal(format!(
                "successful request to '{}' reported as failure",
                self.path
            )),
        }
    }
}

/// Executes sub-requests for one backend
pub struct RequestExecutor {
    session: Arc<BackendSession>,
    transport: Arc<dyn HttpTransport>,
}

impl RequestExecutor {
    pub fn new(session: Arc<BackendSession>, transport: Arc<dyn HttpTransport>) -> Self {
        Self { session, transport }
    }

    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    /// GET `path`, retrying once after re-authentication on 401/403
    pub async fn execute(&self, path: &str, cancel: &CancellationToken) -> SubRequestOutcome {
        let authenticated = self.session.uses_auth_token();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let credential = if authenticated {
                self.session.current_credential()
            } else {
                None
            };
            let mut request = HttpRequest::get(path);
            if let Some(credential) = &credential {
                request = request.with_bearer(credential.token());
            }

            let response = match self.transport.send(request, cancel).await {
                Ok(response) => response,
                Err(TransportError::Cancelled) => {
                    return SubRequestOutcome::new(path, StatusClass::Cancelled, attempts)
                }
                Err(err) => {
                    return SubRequestOutcome::new(path, StatusClass::OtherFailure, attempts)
                        .with_detail(err.to_string())
                }
            };

            if !(authenticated && response.is_auth_failure() && attempts == 1) {
                return classify(path, response, attempts);
            }

            tracing::debug!(
                backend = self.session.name(),
                path = %path,
                status = response.status,
                "Credential rejected, re-authenticating"
            );
            if let Some(credential) = &credential {
                self.session.invalidate_credential(credential);
            }

            match self.session.ensure_authenticated(cancel).await {
                Ok(_) => continue,
                Err(CollectionError::Cancelled) => {
                    return SubRequestOutcome::new(path, StatusClass::Cancelled, attempts)
                }
                Err(err @ CollectionError::RateLimited { .. }) => {
                    return SubRequestOutcome::new(path, StatusClass::RateLimited, attempts)
                        .with_detail(err.to_string())
                }
                Err(err) => {
                    return SubRequestOutcome::new(path, StatusClass::AuthFailure, attempts)
                        .with_status(response.status)
                        .with_detail(err.to_string())
                }
            }
        }
    }
}

fn classify(path: &str, response: HttpResponse, attempts: u32) -> SubRequestOutcome {
    let status = response.status;

    if response.is_success() {
        return match serde_json::from_str::<Value>(&response.body) {
            Ok(payload) => {
                let mut outcome =
                    SubRequestOutcome::new(path, StatusClass::Ok, attempts).with_status(status);
                outcome.payload = Some(payload);
                outcome
            }
            Err(e) => SubRequestOutcome::new(path, StatusClass::OtherFailure, attempts)
                .with_status(status)
                .with_detail(format!("invalid JSON body: {}", e)),
        };
    }

    let class = if response.is_auth_failure() {
        StatusClass::AuthFailure
    } else if response.is_rate_limited() {
        StatusClass::RateLimited
    } else {
        StatusClass::OtherFailure
    };

    let mut outcome = SubRequestOutcome::new(path, class, attempts).with_status(status);
    if !response.body.is_empty() {
        outcome = outcome.with_detail(format!("status {}: {}", status, truncate(&response.body, 200)));
    }
    outcome
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backends::testing::{StubBackend, LOGIN_PATH};
    use crate::services::clock::ManualClock;
    use crate::services::transport::testing::ScriptedTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor(transport: &Arc<ScriptedTransport>, auth: bool) -> RequestExecutor {
        let backend = if auth {
            StubBackend::new(1).with_auth()
        } else {
            StubBackend::new(1)
        };
        let session = Arc::new(BackendSession::new(
            Arc::new(backend),
            transport.clone(),
            Arc::new(ManualClock::new()),
        ));
        RequestExecutor::new(session, transport.clone())
    }

    /// Issues token-1, token-2, ...; `/leg1` answers with `leg1` for any bearer
    fn gateway(leg1: impl Fn(Option<&str>) -> HttpResponse + Send + Sync + 'static) -> ScriptedTransport {
        let issued = AtomicUsize::new(0);
        ScriptedTransport::new(move |request| match request.path.as_str() {
            LOGIN_PATH => {
                let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(HttpResponse::new(200, format!(r#"{{"token":"token-{}"}}"#, n)))
            }
            "/leg1" => Ok(leg1(request.header("authorization"))),
            _ => Ok(HttpResponse::new(200, "{}")),
        })
    }

    #[tokio::test]
    async fn test_reauth_once_then_succeed() {
        let transport = Arc::new(gateway(|bearer| match bearer {
            Some("Bearer token-1") => HttpResponse::new(401, ""),
            _ => HttpResponse::new(200, r#"{"value": 7}"#),
        }));
        let executor = executor(&transport, true);
        let cancel = CancellationToken::new();
        executor.session().ensure_authenticated(&cancel).await.unwrap();

        let outcome = executor.execute("/leg1", &cancel).await;

        assert_eq!(outcome.class, StatusClass::Ok);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.payload.unwrap()["value"], 7);
        assert_eq!(transport.count(LOGIN_PATH), 2);
        assert_eq!(
            executor.session().current_credential().unwrap().token(),
            "token-2"
        );
    }

    #[tokio::test]
    async fn test_second_rejection_is_final() {
        let transport = Arc::new(gateway(|_| HttpResponse::new(403, "")));
        let executor = executor(&transport, true);
        let cancel = CancellationToken::new();
        executor.session().ensure_authenticated(&cancel).await.unwrap();

        let outcome = executor.execute("/leg1", &cancel).await;

        assert_eq!(outcome.class, StatusClass::AuthFailure);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.status, Some(403));
        assert_eq!(transport.count("/leg1"), 2);
        assert!(matches!(
            outcome.to_error("stub", Duration::ZERO),
            CollectionError::AuthenticationFailure { .. }
        ));
    }

    #[tokio::test]
    async fn test_unauthenticated_backend_does_not_retry() {
        let transport = Arc::new(gateway(|_| HttpResponse::new(401, "")));
        let executor = executor(&transport, false);

        let outcome = executor.execute("/leg1", &CancellationToken::new()).await;

        assert_eq!(outcome.class, StatusClass::AuthFailure);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.total(), 1);
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let cancel = CancellationToken::new();

        let server_error = Arc::new(gateway(|_| HttpResponse::new(500, "oops")));
        let outcome = executor(&server_error, false).execute("/leg1", &cancel).await;
        assert_eq!(outcome.class, StatusClass::OtherFailure);
        assert_eq!(outcome.status, Some(500));
        assert_eq!(outcome.attempts, 1);

        let limited = Arc::new(gateway(|_| HttpResponse::new(429, "")));
        let outcome = executor(&limited, false).execute("/leg1", &cancel).await;
        assert_eq!(outcome.class, StatusClass::RateLimited);

        let garbage = Arc::new(gateway(|_| HttpResponse::new(200, "<html>")));
        let outcome = executor(&garbage, false).execute("/leg1", &cancel).await;
        assert_eq!(outcome.class, StatusClass::OtherFailure);
        assert!(outcome.payload.is_none());
        assert!(outcome.detail.unwrap().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn test_transport_error_is_other_failure() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Err(TransportError::Connect("connection refused".into()))
        }));
        let outcome = executor(&transport, false)
            .execute("/leg1", &CancellationToken::new())
            .await;

        assert_eq!(outcome.class, StatusClass::OtherFailure);
        assert_eq!(outcome.status, None);
        assert!(outcome.detail.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_cancelled_request() {
        let transport = Arc::new(gateway(|_| HttpResponse::new(200, "{}")).hanging_on("/leg1"));
        let executor = executor(&transport, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = executor.execute("/leg1", &cancel).await;
        assert_eq!(outcome.class, StatusClass::Cancelled);
        assert!(outcome.to_error("stub", Duration::ZERO).is_cancelled());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
