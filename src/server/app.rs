//! Exporter process lifecycle
//!
//! Binds the scrape listener, serves until SIGINT or SIGTERM, then aborts
//! whatever collection pass is still talking to a gateway.

use crate::{
    config::Settings,
    server::{routes, state::AppState},
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::signal;

/// A configured exporter, ready to bind
pub struct App {
    addr: String,
    state: AppState,
}

impl App {
    /// Wire one session and collector per enabled gateway.
    pub async fn new(settings: Settings) -> Result<Self> {
        let addr = settings.server_addr();
        let state = AppState::new(settings).await?;
        tracing::debug!(
            backends = ?state.coordinator.backends(),
            "Gateway collectors ready"
        );

        Ok(Self { addr, state })
    }

    /// Serve `/metrics` and the probes until a shutdown signal arrives.
    ///
    /// Scrapes already waiting on a pass are answered before the listener
    /// closes; the pass itself is cancelled afterwards.
    pub async fn run_with_graceful_shutdown(self) -> Result<()> {
        let addr = self
            .addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address {}", self.addr))?;
        let router = routes::create_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!(%addr, "Serving metrics");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Listener closed, cancelling in-flight collection");
        self.state.coordinator.shutdown();

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "Shutting down"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "Shutting down"),
    }
}
