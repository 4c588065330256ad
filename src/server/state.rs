//! Application state container
//!
//! Holds the collection coordinator and the metric sink shared by every
//! request handler via Axum's state extraction.

use crate::config::Settings;
use crate::services::{
    Clock, CollectionCoordinator, CoordinatorConfig, EnphaseGateway, FanOutCollector,
    PrometheusSink, ReqwestTransport, SessionPolicy, SystemClock, TeslaCredentials, TeslaGateway,
    TransportConfig,
};
use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared application state
///
/// Cheap to clone; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Single-flight collection across all configured gateways
    pub coordinator: CollectionCoordinator,

    /// Registry rendered by `/metrics`
    pub sink: Arc<PrometheusSink>,

    /// Application start time (for uptime calculation)
    pub start_time: Instant,
}

impl AppState {
    /// Build transports, sessions and collectors for every enabled gateway
    pub async fn new(settings: Settings) -> anyhow::Result<Self> {
        let settings = Arc::new(settings);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sink = Arc::new(PrometheusSink::new());
        let mut collectors = Vec::new();

        if settings.tesla.enabled {
            let tesla = &settings.tesla;
            let base_url = tesla
                .base_url()
                .context("TESLA_GATEWAY_HOST is required when the Tesla gateway is enabled")?;

            let mut transport_config =
                TransportConfig::new(base_url, Duration::from_secs(tesla.request_timeout_seconds))
                    .with_accept_invalid_certs(tesla.accept_invalid_certs);
            if let Some(request_host) = &tesla.request_host {
                transport_config = transport_config.with_host_header(request_host.clone());
            }
            let transport = Arc::new(
                ReqwestTransport::new(transport_config).context("Failed to build Tesla gateway client")?,
            );

            let backend = TeslaGateway::new(
                TeslaCredentials {
                    email: tesla.email.clone().unwrap_or_default(),
                    password: tesla.password.clone().unwrap_or_default(),
                    username: tesla.username.clone(),
                },
                SessionPolicy {
                    login_check_interval: Duration::from_secs(tesla.login_check_cache_seconds),
                    rate_limit_backoff: Duration::from_secs(tesla.rate_limit_backoff_seconds),
                },
            );

            tracing::info!(host = ?tesla.host, "Tesla gateway backend enabled");
            collectors.push(FanOutCollector::new(
                Arc::new(backend),
                transport,
                clock.clone(),
                sink.clone(),
            )?);
        }

        if settings.enphase.enabled {
            let enphase = &settings.enphase;
            let base_url = enphase
                .base_url()
                .context("ENPHASE_HOST is required when the Enphase gateway is enabled")?;

            let transport = Arc::new(
                ReqwestTransport::new(TransportConfig::new(
                    base_url,
                    Duration::from_secs(enphase.request_timeout_seconds),
                ))
                .context("Failed to build Enphase gateway client")?,
            );

            tracing::info!(host = ?enphase.host, "Enphase gateway backend enabled");
            collectors.push(FanOutCollector::new(
                Arc::new(EnphaseGateway::new()),
                transport,
                clock.clone(),
                sink.clone(),
            )?);
        }

        let coordinator = CollectionCoordinator::new(
            collectors,
            clock,
            CoordinatorConfig {
                cache_ttl: settings.exporter.cache_ttl(),
                max_collection_duration: settings.exporter.collection_timeout(),
            },
        );

        tracing::info!(
            backends = ?coordinator.backends(),
            cache_ttl_secs = settings.exporter.response_cache_duration_seconds,
            "Application state initialized successfully"
        );

        Ok(Self::from_parts(settings, coordinator, sink))
    }

    /// Assemble state from pre-built parts
    pub fn from_parts(
        settings: Arc<Settings>,
        coordinator: CollectionCoordinator,
        sink: Arc<PrometheusSink>,
    ) -> Self {
        Self {
            settings,
            coordinator,
            sink,
            start_time: Instant::now(),
        }
    }

    /// Get the application uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
