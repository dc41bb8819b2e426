//! Error types for mycelia-trust.

use thiserror::Error;

/// Result type for mycelia-trust operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during trust operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A raw value was outside [0.0, 1.0] or not finite.
    #[error("trust score out of range: {0}")]
    OutOfRange(f64),

    /// Persistence I/O failed.
    #[error("trust table I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence (de)serialization failed.
    #[error("trust table serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
