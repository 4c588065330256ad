//! Solar gateway Prometheus exporter library

// Public modules
pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod server;
pub mod services;

// Re-export commonly used types
pub use config::Settings;
pub use error::{ApiError, CollectionError};
pub use server::App;
