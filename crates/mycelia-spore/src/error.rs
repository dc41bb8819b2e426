//! Error types for mycelia-spore.

use thiserror::Error;

/// Result type for mycelia-spore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the discovery layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Identity validation failed (bad signature, bad proof, or isolation).
    #[error(transparent)]
    Identity(#[from] mycelia_identity::Error),

    /// A record was signed by a key the network does not authorize.
    #[error("record signer {signer} is not authorized for this network")]
    UnauthorizedSigner { signer: String },

    /// A record's schema version is not understood.
    #[error("unsupported spore schema version {actual} (supported: {supported})")]
    Schema { actual: u32, supported: u32 },

    /// Canonical encoding for signing failed.
    #[error("record encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    /// Snapshot / log persistence failed.
    #[error("spore storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot / log (de)serialization failed.
    #[error("spore storage serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The primary log rejected an out-of-order entry.
    #[error("primary log entry out of order: expected index {expected}, got {actual}")]
    LogOrder { expected: u64, actual: u64 },
}
