//! Local node keypair.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::network::NetworkIdentity;
use crate::node_id::NodeId;

/// A node's Ed25519 signing keypair.
///
/// Generated once at bootstrap; the node id is derived from the verifying
/// key, so the keypair *is* the node's identity. The signing half never
/// leaves this struct.
#[derive(Clone)]
pub struct NodeKeypair {
    signing: SigningKey,
}

impl NodeKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from secret key bytes (for restart from persisted state).
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    /// The node id derived from this keypair.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_verifying_key(&self.signing.verifying_key())
    }

    /// The public verification key.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Produce this node's membership proof for a network.
    pub fn membership_proof(&self, network: &NetworkIdentity) -> [u8; 32] {
        network.membership_proof_for(&self.signing.verifying_key())
    }

    /// Secret key bytes for persistence. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret half
        f.debug_struct("NodeKeypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}
