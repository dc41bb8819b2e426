//! Error types for the node runtime.

use thiserror::Error;

/// Result type for mycelia-node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the node runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Identity(#[from] mycelia_identity::Error),

    #[error(transparent)]
    Spore(#[from] mycelia_spore::Error),

    #[error(transparent)]
    Trust(#[from] mycelia_trust::Error),

    #[error(transparent)]
    Consensus(#[from] mycelia_consensus::Error),

    #[error("node state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
