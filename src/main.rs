//! Solar Gateway Exporter
//!
//! Serves Tesla and Enphase gateway readings as Prometheus metrics.

use anyhow::Result;
use clap::Parser;
use solar_gateway_exporter::{
    config::{Environment, Settings},
    server::App,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Solar Gateway Exporter
///
/// Polls local solar/battery gateways on each scrape and exposes the
/// readings in the Prometheus text format.
#[derive(Parser, Debug)]
#[command(name = "solar-gateway-exporter")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT env var)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides HOST env var)
    #[arg(long)]
    host: Option<String>,

    /// Log level: trace, debug, info, warn, error (overrides LOG_LEVEL env var)
    #[arg(long)]
    log_level: Option<String>,

    /// Environment: dev, staging, prod (overrides ENVIRONMENT env var)
    #[arg(short, long)]
    env: Option<Environment>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (before logging, so we can use log_level)
    let mut settings = Settings::load()?;

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(log_level) = args.log_level {
        settings.log_level = log_level;
    }
    if let Some(env) = args.env {
        settings.environment = env;
    }

    init_tracing(&settings.log_level);

    // CLI overrides bypassed the check done at load time
    settings.validate()?;

    tracing::info!(
        app_name = %settings.app_name,
        version = %settings.app_version,
        environment = %settings.environment,
        host = %settings.host,
        port = %settings.port,
        tesla_enabled = settings.tesla.enabled,
        enphase_enabled = settings.enphase.enabled,
        "Starting application"
    );

    let app = App::new(settings).await?;

    app.run_with_graceful_shutdown().await?;

    tracing::info!("Application shutdown complete");

    Ok(())
}

/// Initialize tracing subscriber with JSON output
fn init_tracing(log_level: &str) {
    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let console_layer = fmt::layer().json().with_filter(filter);

    tracing_subscriber::registry().with(console_layer).init();
}
