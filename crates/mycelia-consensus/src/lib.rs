//! Commit-reveal consensus over network operations.
//!
//! Votes are cast in two phases so nobody can vote reactively: first a
//! blinded digest of the locally computed result ([`CommitRecord`]), then
//! the plaintext and nonce that open it ([`RevealRecord`]). A result commits
//! only with strictly more than 2/3 of the participating trust weight behind
//! it; equivocating votes are removed from the tally entirely and surface as
//! trust evidence.
//!
//! - [`Round`]: the pure per-operation state machine
//! - [`tally`]: trust-weighted vote weighing
//! - [`ResourceScheduler`]: strict FIFO per resource key, concurrency across
//!   keys
//! - [`Engine`]: the tokio task driving rounds, deadlines, and the queue
//!
//! Service deployment decisions skip commit-reveal and resolve by issuer
//! authority (Primary over Seed over Latent), given sufficient standing.

pub mod engine;
pub mod error;
pub mod operation;
pub mod round;
pub mod scheduler;
pub mod tally;

pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{Error, Result};
pub use operation::{
    commit_digest, fresh_nonce, CommitRecord, ConsensusOperation, OperationId, Proposal,
    RevealRecord,
};
pub use round::{Phase, Resolution, Round, RoundConfig, Voter};
pub use scheduler::ResourceScheduler;
pub use tally::{supermajority, tally, TallyOutcome};
