//! Node runtime for the Mycelia membership core.
//!
//! Wires the discovery layer, the trust table, and the consensus engine
//! into one process: persistent identity under a data directory, background
//! tasks for seed snapshots and idle decay, and the external interface
//! (registration, active-node queries, proposals, commits, reveals).

pub mod config;
pub mod error;
pub mod node;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use node::Node;
