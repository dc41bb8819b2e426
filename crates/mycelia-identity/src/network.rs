//! Network identity and cryptographic isolation.
//!
//! A [`NetworkIdentity`] is created exactly once, at network formation, and
//! is immutable afterwards. Every record and message in the membership core
//! carries (or is checked against) it; traffic from a different network is
//! rejected with an isolation error rather than merged.
//!
//! Isolation works through membership proofs: a node proves it belongs to
//! the network by presenting `blake3(isolation_key ‖ verifying_key)` signed
//! with its own key. A node that never learned the isolation key cannot
//! produce the proof, and a stolen proof is useless without the matching
//! signing key.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node_id::NodeId;
use crate::now_millis;

/// Identity of a mycelia network. Immutable after genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// 32-byte network identifier, derived from the isolation key and name.
    pub network_id: [u8; 32],
    /// Human-readable network name.
    pub network_name: String,
    /// Unix-millis timestamp of network formation.
    pub genesis_timestamp: u64,
    /// Ordered identifiers of the genesis nodes. Their keys are authorized
    /// to sign spore records from the first moment of the network's life.
    pub genesis_nodes: Vec<NodeId>,
    /// Protocol compatibility version.
    pub compat_version: u32,
    /// Shared isolation key used to reject cross-network traffic.
    pub isolation_key: [u8; 32],
}

/// Current protocol compatibility version.
pub const COMPAT_VERSION: u32 = 1;

impl NetworkIdentity {
    /// Create a new network identity at genesis.
    ///
    /// Generates a fresh isolation key; the network id is derived from the
    /// key and the name so two networks can never collide by name alone.
    pub fn new_genesis(network_name: impl Into<String>, genesis_nodes: Vec<NodeId>) -> Self {
        let network_name = network_name.into();
        let mut isolation_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut isolation_key);

        let mut hasher = blake3::Hasher::new();
        hasher.update(&isolation_key);
        hasher.update(network_name.as_bytes());
        let network_id = *hasher.finalize().as_bytes();

        Self {
            network_id,
            network_name,
            genesis_timestamp: now_millis(),
            genesis_nodes,
            compat_version: COMPAT_VERSION,
            isolation_key,
        }
    }

    /// Compute the membership proof expected from a node with this key.
    pub fn membership_proof_for(&self, key: &VerifyingKey) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.isolation_key);
        hasher.update(key.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Validate a node's membership claim.
    ///
    /// The node presents its proof bytes and a signature over them. Both the
    /// signature and the proof itself must check out.
    pub fn validate_membership(
        &self,
        proof: &[u8; 32],
        signature: &Signature,
        key: &VerifyingKey,
    ) -> Result<()> {
        key.verify(proof, signature)?;
        if *proof != self.membership_proof_for(key) {
            return Err(Error::InvalidProof {
                network: self.network_name.clone(),
            });
        }
        Ok(())
    }

    /// Check that another identity names the same network.
    pub fn validate_claim(&self, claimed: &NetworkIdentity) -> Result<()> {
        if claimed.network_id != self.network_id {
            return Err(Error::Isolation {
                expected: hex::encode(&self.network_id[..8]),
                actual: hex::encode(&claimed.network_id[..8]),
            });
        }
        Ok(())
    }

    /// True if the given node was part of genesis.
    pub fn is_genesis_node(&self, node: &NodeId) -> bool {
        self.genesis_nodes.contains(node)
    }
}
