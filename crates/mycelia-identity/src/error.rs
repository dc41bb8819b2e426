//! Error types for mycelia-identity.

use thiserror::Error;

/// Result type for mycelia-identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during identity operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A signature did not verify against the presented key.
    #[error("signature verification failed: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    /// A membership proof did not match this network's isolation key.
    #[error("membership proof does not match network {network}")]
    InvalidProof { network: String },

    /// A record claimed membership in a different network.
    #[error("cross-network record rejected: expected {expected}, got {actual}")]
    Isolation { expected: String, actual: String },

    /// Raw bytes had the wrong length for the expected type.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    Length {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}
