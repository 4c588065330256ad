//! Application settings and configuration
//!
//! Settings are read from environment variables (and a `.env` file when
//! present) with defaults suitable for a home network.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::time::Duration;

/// Application environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[value(alias = "dev")]
    Development,
    #[value(alias = "stage")]
    Staging,
    #[value(alias = "prod")]
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Staging => write!(f, "staging"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl std::str::FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" | "stage" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => anyhow::bail!("Invalid environment: {}. Expected: development, staging, or production", s),
        }
    }
}

/// Collection caching and deadline settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExporterConfig {
    /// How long a successful collection is served from cache; 0 disables caching
    pub response_cache_duration_seconds: u64,
    /// Upper bound on a single collection pass
    pub metrics_request_timeout_seconds: u64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            response_cache_duration_seconds: 5,
            metrics_request_timeout_seconds: 5,
        }
    }
}

impl ExporterConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_duration_seconds)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_request_timeout_seconds)
    }
}

/// Tesla gateway connection and login
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeslaGatewayConfig {
    pub enabled: bool,
    /// Address of the gateway, with or without scheme
    pub host: Option<String>,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub username: String,
    /// `Host` header sent to the gateway, which only answers to certain names
    pub request_host: Option<String>,
    pub request_timeout_seconds: u64,
    /// How long a verified token is trusted before it is probed again
    pub login_check_cache_seconds: u64,
    pub rate_limit_backoff_seconds: u64,
    /// The gateway ships with a self-signed certificate
    pub accept_invalid_certs: bool,
}

impl Default for TeslaGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            email: None,
            password: None,
            username: "customer".to_string(),
            request_host: Some("powerwall".to_string()),
            request_timeout_seconds: 10,
            login_check_cache_seconds: 5,
            rate_limit_backoff_seconds: 15,
            accept_invalid_certs: true,
        }
    }
}

impl TeslaGatewayConfig {
    pub fn base_url(&self) -> Option<String> {
        self.host.as_deref().map(|host| with_scheme(host, "https"))
    }
}

/// Enphase gateway connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnphaseConfig {
    pub enabled: bool,
    pub host: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for EnphaseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: None,
            request_timeout_seconds: 10,
        }
    }
}

impl EnphaseConfig {
    pub fn base_url(&self) -> Option<String> {
        self.host.as_deref().map(|host| with_scheme(host, "http"))
    }
}

/// Main application settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    // App settings
    pub app_name: String,
    pub app_version: String,
    pub environment: Environment,
    pub log_level: String,

    // Server settings
    pub host: String,
    pub port: u16,

    pub exporter: ExporterConfig,

    // Backends
    pub tesla: TeslaGatewayConfig,
    pub enphase: EnphaseConfig,
}

impl Settings {
    /// Load settings from environment variables with defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignored in production typically)
        dotenvy::dotenv().ok();

        Self::from_source(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_source<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| v.trim().to_lowercase().parse().ok())
                .unwrap_or(default)
        };
        let seconds = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid {} value: {}", key, value)),
                None => Ok(default),
            }
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let tesla_defaults = TeslaGatewayConfig::default();

        let settings = Self {
            // App settings
            app_name: get("APP_NAME", "solar-gateway-exporter"),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: get("ENVIRONMENT", "development")
                .parse()
                .unwrap_or_default(),
            log_level: get("LOG_LEVEL", "info"),

            // Server settings
            host: get("HOST", "0.0.0.0"),
            port: get("PORT", "8080")
                .parse()
                .context("Invalid PORT value")?,

            exporter: ExporterConfig {
                response_cache_duration_seconds: seconds("RESPONSE_CACHE_DURATION_SECONDS", 5)?,
                metrics_request_timeout_seconds: seconds("METRICS_REQUEST_TIMEOUT_SECONDS", 5)?,
            },

            tesla: TeslaGatewayConfig {
                enabled: flag("TESLA_GATEWAY_ENABLED", false),
                host: optional("TESLA_GATEWAY_HOST"),
                email: optional("TESLA_GATEWAY_EMAIL"),
                password: optional("TESLA_GATEWAY_PASSWORD"),
                username: get("TESLA_GATEWAY_USERNAME", &tesla_defaults.username),
                request_host: optional("TESLA_GATEWAY_REQUEST_HOST").or(tesla_defaults.request_host),
                request_timeout_seconds: seconds("TESLA_GATEWAY_REQUEST_TIMEOUT_SECONDS", 10)?,
                login_check_cache_seconds: seconds("TESLA_GATEWAY_LOGIN_CHECK_CACHE_SECONDS", 5)?,
                rate_limit_backoff_seconds: seconds("TESLA_GATEWAY_RATE_LIMIT_BACKOFF_SECONDS", 15)?,
                accept_invalid_certs: flag("TESLA_GATEWAY_ACCEPT_INVALID_CERTS", true),
            },

            enphase: EnphaseConfig {
                enabled: flag("ENPHASE_ENABLED", false),
                host: optional("ENPHASE_HOST"),
                request_timeout_seconds: seconds("ENPHASE_REQUEST_TIMEOUT_SECONDS", 10)?,
            },
        };

        // Validate settings
        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.exporter.metrics_request_timeout_seconds == 0 {
            anyhow::bail!("METRICS_REQUEST_TIMEOUT_SECONDS must be > 0");
        }

        if self.tesla.enabled {
            if self.tesla.host.is_none() {
                anyhow::bail!("TESLA_GATEWAY_HOST is required when the Tesla gateway is enabled");
            }
            if self.tesla.email.is_none() || self.tesla.password.is_none() {
                anyhow::bail!(
                    "TESLA_GATEWAY_EMAIL and TESLA_GATEWAY_PASSWORD are required when the Tesla gateway is enabled"
                );
            }
        }

        if self.enphase.enabled && self.enphase.host.is_none() {
            anyhow::bail!("ENPHASE_HOST is required when the Enphase gateway is enabled");
        }

        if !self.tesla.enabled && !self.enphase.enabled {
            tracing::warn!("No gateway backend is enabled; /metrics will be empty");
        }

        Ok(())
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "solar-gateway-exporter".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: Environment::Development,
            log_level: "info".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            exporter: ExporterConfig::default(),
            tesla: TeslaGatewayConfig::default(),
            enphase: EnphaseConfig::default(),
        }
    }
}

fn with_scheme(host: &str, scheme: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("{}://{}", scheme, host)
    }
}
