//! Error types for mycelia-consensus.

use thiserror::Error;

/// Result type for mycelia-consensus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a consensus round.
#[derive(Debug, Error)]
pub enum Error {
    /// A node submitted a second commit or reveal for the same operation.
    #[error("duplicate {what} from {node} for operation {operation}")]
    Duplicate {
        what: &'static str,
        node: String,
        operation: String,
    },

    /// A reveal did not match the node's committed digest.
    #[error("reveal from {node} does not match its commit digest")]
    Mismatch { node: String },

    /// The node is not in the round's eligible voter set.
    #[error("node {node} is not eligible for operation {operation}")]
    Ineligible { node: String, operation: String },

    /// A submission arrived in the wrong phase.
    #[error("operation {operation} is in phase {phase}, cannot accept {what}")]
    Phase {
        operation: String,
        phase: &'static str,
        what: &'static str,
    },

    /// Too few eligible voters to open a round.
    #[error("quorum not met: {eligible} eligible voters, need at least {required}")]
    Quorum { eligible: usize, required: usize },

    /// The operation id is not known to the engine.
    #[error("unknown operation {operation}")]
    UnknownOperation { operation: String },

    /// Commit or reveal signature failed verification.
    #[error(transparent)]
    Identity(#[from] mycelia_identity::Error),

    /// Canonical encoding for signing failed.
    #[error("consensus encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    /// The engine task has shut down.
    #[error("consensus engine is not running")]
    EngineClosed,
}
