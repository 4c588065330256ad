//! Error types

mod types;

pub use types::{ApiError, CollectionError};
