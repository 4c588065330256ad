//! HTTP transport to a single gateway
//!
//! The collection core only talks to gateways through [`HttpTransport`], so
//! tests can script responses without a network. [`ReqwestTransport`] is the
//! production implementation.

use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Request / Response
// ============================================================================

/// An outgoing request, relative to the transport's base address
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header(header::AUTHORIZATION.as_str(), format!("Bearer {}", token))
    }

    /// Look up a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed exchange
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 and 403 both mean the credential was not accepted
    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// Network-level failures (no HTTP status was received)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request failed: {0}")]
    Other(String),
}

// ============================================================================
// Transport trait
// ============================================================================

/// Sends requests to one gateway
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Host name of the gateway, used as a metric label
    fn host(&self) -> &str;

    /// Perform `request`, aborting as soon as `cancel` fires
    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// reqwest implementation
// ============================================================================

/// Connection settings for [`ReqwestTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Scheme and authority, e.g. `https://192.168.1.20`
    pub base_url: String,
    /// Value for the `Host` header when the gateway only accepts specific names
    pub host_header: Option<String>,
    pub timeout: Duration,
    /// The Tesla gateway serves a self-signed certificate
    pub accept_invalid_certs: bool,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            host_header: None,
            timeout,
            accept_invalid_certs: false,
        }
    }

    pub fn with_host_header(mut self, host: impl Into<String>) -> Self {
        self.host_header = Some(host.into());
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

/// [`HttpTransport`] backed by a pooled `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
    host: String,
    host_header: Option<String>,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| TransportError::Other(format!("invalid base url '{}': {}", config.base_url, e)))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| TransportError::Other(format!("base url '{}' has no host", config.base_url)))?
            .to_string();

        let client = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            host,
            host_header: config.host_header,
            timeout: config.timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(|e| TransportError::Other(format!("invalid path '{}': {}", request.path, e)))?;

        let mut builder = self.client.request(request.method.clone(), url);
        if let Some(host) = &self.host_header {
            builder = builder.header(header::HOST, host);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn send(
        &self,
        request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let method = request.method.clone();
        let path = request.path.clone();

        let result = tokio::select! {
            result = self.execute(request) => result,
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => tracing::debug!(
                host = %self.host,
                method = %method,
                path = %path,
                status = response.status,
                duration_ms = elapsed_ms,
                "Outbound request completed"
            ),
            Err(TransportError::Cancelled) => tracing::debug!(
                host = %self.host,
                method = %method,
                path = %path,
                "Outbound request cancelled"
            ),
            Err(err) => tracing::warn!(
                host = %self.host,
                method = %method,
                path = %path,
                error = %err,
                duration_ms = elapsed_ms,
                "Outbound request failed"
            ),
        }

        result
    }
}

// ============================================================================
// Scripted transport for tests
// ============================================================================
