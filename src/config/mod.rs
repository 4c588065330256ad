//! Configuration management module
//!
//! This module handles loading and validating application configuration
//! from environment variables and .env files.

pub mod settings;

pub use settings::{EnphaseConfig, Environment, ExporterConfig, Settings, TeslaGatewayConfig};
