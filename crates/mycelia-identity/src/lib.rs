//! Network and node identity for the Mycelia membership core.
//!
//! Provides the cryptographic identities everything else builds on:
//!
//! - [`NetworkIdentity`] - immutable genesis identity of a network, with the
//!   isolation key used to reject cross-network traffic
//! - [`NodeId`] / [`NodeKeypair`] - a node's identifier is the Blake3 hash of
//!   its Ed25519 verifying key
//! - [`NodeRole`] - the closed set of roles in the network hierarchy
//!
//! Signature and hash algorithms are fixed (Ed25519, Blake3) but treated as
//! opaque by the rest of the core.

mod error;
mod keypair;
mod network;
mod node_id;
mod role;

pub use error::{Error, Result};
pub use keypair::NodeKeypair;
pub use network::{NetworkIdentity, COMPAT_VERSION};
pub use node_id::NodeId;
pub use role::NodeRole;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in milliseconds.
///
/// All timestamps in the core are u64 unix-millis; components that need
/// testable time take explicit timestamps and use this only at the edges.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
