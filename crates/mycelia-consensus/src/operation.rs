//! Operations put to consensus, and the commit/reveal records cast on them.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use mycelia_identity::{NodeId, NodeKeypair};
use mycelia_spore::SporeTier;
use mycelia_trust::TrustScore;

use crate::error::Result;

/// Unique identifier of one consensus attempt.
///
/// Fresh per attempt: a retry after timeout gets a new id, never reuses the
/// old one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperationId(pub [u8; 32]);

impl OperationId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", hex::encode(&self.0[..4]))
    }
}

/// The state-changing operations the network agrees on.
///
/// Closed set: every consumer matches exhaustively, so adding a variant is a
/// deliberate, compiler-enforced change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusOperation {
    /// Change a network-wide configuration value.
    NetworkConfigurationChange { key: String, value: String },
    /// Adjust a node's trust score by agreement rather than observation.
    TrustScoreModification { node: NodeId, proposed: TrustScore },
    /// Admit a node into the network.
    NodeAdmission { node: NodeId },
    /// Exclude a node from the network.
    NodeExclusion { node: NodeId },
    /// Deploy or retire a service. Resolved by authority precedence, not
    /// commit-reveal.
    ServiceDeploymentDecision {
        service: String,
        issuer_tier: SporeTier,
        deploy: bool,
    },
}

impl ConsensusOperation {
    /// The resource key this operation contends on.
    ///
    /// Operations sharing a key resolve strictly in proposal order;
    /// operations with disjoint keys run concurrently.
    pub fn resource_key(&self) -> [u8; 32] {
        match self {
            ConsensusOperation::NetworkConfigurationChange { key, .. } => {
                *blake3::hash(key.as_bytes()).as_bytes()
            }
            ConsensusOperation::TrustScoreModification { node, .. } => node.0,
            ConsensusOperation::NodeAdmission { node } => node.0,
            ConsensusOperation::NodeExclusion { node } => node.0,
            ConsensusOperation::ServiceDeploymentDecision { service, .. } => {
                *blake3::hash(service.as_bytes()).as_bytes()
            }
        }
    }

    /// Whether this operation goes through the full commit-reveal protocol.
    pub fn requires_commit_reveal(&self) -> bool {
        !matches!(self, ConsensusOperation::ServiceDeploymentDecision { .. })
    }

    /// Minimum trust a node needs to vote on (or issue) this operation.
    pub fn required_trust(&self) -> f64 {
        match self {
            ConsensusOperation::NetworkConfigurationChange { .. } => 0.5,
            ConsensusOperation::TrustScoreModification { .. } => 0.5,
            ConsensusOperation::NodeAdmission { .. } => 0.3,
            ConsensusOperation::NodeExclusion { .. } => 0.6,
            ConsensusOperation::ServiceDeploymentDecision { .. } => 0.4,
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusOperation::NetworkConfigurationChange { .. } => "config-change",
            ConsensusOperation::TrustScoreModification { .. } => "trust-modification",
            ConsensusOperation::NodeAdmission { .. } => "admission",
            ConsensusOperation::NodeExclusion { .. } => "exclusion",
            ConsensusOperation::ServiceDeploymentDecision { .. } => "service-deployment",
        }
    }
}

/// A proposed operation, as entered into the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Fresh id for this attempt.
    pub id: OperationId,
    /// The proposing node.
    pub proposer: NodeId,
    /// What is being decided.
    pub operation: ConsensusOperation,
    /// Proposal time, unix millis.
    pub proposed_at: u64,
}

/// Compute the commit digest for a result value and blinding nonce.
///
/// The nonce keeps low-entropy results (a yes/no, a small config value)
/// unguessable from the digest during the commit phase.
pub fn commit_digest(value: &[u8], nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(value);
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

/// A node's sealed vote: digest of its result, no plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub operation: OperationId,
    pub node: NodeId,
    pub digest: [u8; 32],
    pub committed_at: u64,
    pub signature: Signature,
}

impl CommitRecord {
    fn signing_bytes(
        operation: &OperationId,
        node: &NodeId,
        digest: &[u8; 32],
        committed_at: u64,
    ) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(
            "commit",
            operation,
            node,
            digest,
            committed_at,
        ))?)
    }

    /// Build and sign a commit for a locally computed result.
    pub fn sign(
        keypair: &NodeKeypair,
        operation: OperationId,
        value: &[u8],
        nonce: &[u8; 32],
        now: u64,
    ) -> Result<Self> {
        let node = keypair.node_id();
        let digest = commit_digest(value, nonce);
        let bytes = Self::signing_bytes(&operation, &node, &digest, now)?;
        Ok(Self {
            operation,
            node,
            digest,
            committed_at: now,
            signature: keypair.sign(&bytes),
        })
    }

    /// Verify the commit signature against the node's key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let bytes =
            Self::signing_bytes(&self.operation, &self.node, &self.digest, self.committed_at)?;
        key.verify(&bytes, &self.signature)
            .map_err(mycelia_identity::Error::from)?;
        Ok(())
    }
}

/// A node's opened vote: the plaintext result and the blinding nonce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealRecord {
    pub operation: OperationId,
    pub node: NodeId,
    pub value: Vec<u8>,
    pub nonce: [u8; 32],
    pub revealed_at: u64,
    pub signature: Signature,
}

impl RevealRecord {
    fn signing_bytes(
        operation: &OperationId,
        node: &NodeId,
        value: &[u8],
        nonce: &[u8; 32],
        revealed_at: u64,
    ) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(
            "reveal",
            operation,
            node,
            value,
            nonce,
            revealed_at,
        ))?)
    }

    /// Build and sign a reveal.
    pub fn sign(
        keypair: &NodeKeypair,
        operation: OperationId,
        value: Vec<u8>,
        nonce: [u8; 32],
        now: u64,
    ) -> Result<Self> {
        let node = keypair.node_id();
        let bytes = Self::signing_bytes(&operation, &node, &value, &nonce, now)?;
        Ok(Self {
            operation,
            node,
            value,
            nonce,
            revealed_at: now,
            signature: keypair.sign(&bytes),
        })
    }

    /// Verify the reveal signature against the node's key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<()> {
        let bytes = Self::signing_bytes(
            &self.operation,
            &self.node,
            &self.value,
            &self.nonce,
            self.revealed_at,
        )?;
        key.verify(&bytes, &self.signature)
            .map_err(mycelia_identity::Error::from)?;
        Ok(())
    }

    /// Whether this reveal opens the given commit digest.
    pub fn opens(&self, digest: &[u8; 32]) -> bool {
        commit_digest(&self.value, &self.nonce) == *digest
    }
}

/// Generate a fresh blinding nonce for a commit.
pub fn fresh_nonce() -> [u8; 32] {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
