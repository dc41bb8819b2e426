//! Spore records: the replicated unit of membership state.
//!
//! A spore is a signed snapshot of "who is in this network and how much are
//! they trusted". One record exists per tier; tiers are produced by
//! independent mechanisms (Primary log, Seed snapshots, Latent gossip) so
//! that no single mechanism's failure blinds the node.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use mycelia_identity::{NetworkIdentity, NodeId, NodeKeypair, NodeRole};
use mycelia_trust::TrustScore;

use crate::error::{Error, Result};

/// Spore schema version understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum activity intervals retained per node entry.
const MAX_ACTIVITY_INTERVALS: usize = 32;

/// The three authority tiers, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SporeTier {
    /// Replicated log among backbone nodes. Highest authority.
    Primary,
    /// Periodic snapshots to durable storage. Bootstrap / recovery anchor.
    Seed,
    /// Pairwise anti-entropy gossip. Lowest authority, highest availability.
    Latent,
}

impl SporeTier {
    /// Tiers in descending authority order.
    pub const BY_AUTHORITY: [SporeTier; 3] = [SporeTier::Primary, SporeTier::Seed, SporeTier::Latent];

    /// Numeric authority rank (higher wins).
    pub fn authority(&self) -> u8 {
        match self {
            SporeTier::Primary => 2,
            SporeTier::Seed => 1,
            SporeTier::Latent => 0,
        }
    }
}

impl std::fmt::Display for SporeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SporeTier::Primary => write!(f, "primary"),
            SporeTier::Seed => write!(f, "seed"),
            SporeTier::Latent => write!(f, "latent"),
        }
    }
}

/// One contiguous interval during which a node was active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInterval {
    /// Start, unix millis.
    pub from: u64,
    /// End, unix millis.
    pub until: u64,
}

/// Why a node is currently absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbsenceReason {
    /// Announced maintenance or graceful shutdown.
    Planned,
    /// Stopped responding without announcement.
    Unreachable,
    /// Removed by a resolved exclusion operation.
    Excluded,
}

/// Offline-tracking metadata for an absent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineInfo {
    /// When the absence started, unix millis.
    pub since: u64,
    /// Reason class of the absence.
    pub reason: AbsenceReason,
}

/// A node's membership entry as carried in spore records.
///
/// Owned by whichever record currently holds it; never mutated in place by
/// other nodes. Trust is written only via the trust subsystem and flows back
/// in through [`crate::SporeView::apply_trust_updates`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Node identifier (Blake3 of the verifying key).
    pub node_id: NodeId,
    /// Role in the network hierarchy.
    pub role: NodeRole,
    /// Public verification key.
    pub verifying_key: VerifyingKey,
    /// Reachable network addresses.
    pub addresses: Vec<String>,
    /// Opaque capability descriptor.
    pub capabilities: BTreeMap<String, String>,
    /// Current trust score.
    pub trust: TrustScore,
    /// Last time this node was observed, unix millis.
    pub last_seen: u64,
    /// Bounded history of activity intervals, oldest first.
    pub activity: Vec<ActivityInterval>,
    /// Present while the node is absent.
    pub offline: Option<OfflineInfo>,
}

impl NodeIdentity {
    /// Create an entry for a freshly bootstrapped node.
    pub fn new(keypair: &NodeKeypair, role: NodeRole, addresses: Vec<String>, now: u64) -> Self {
        Self {
            node_id: keypair.node_id(),
            role,
            verifying_key: keypair.verifying_key(),
            addresses,
            capabilities: BTreeMap::new(),
            trust: TrustScore::MIN,
            last_seen: now,
            activity: Vec::new(),
            offline: None,
        }
    }

    /// Record an activity interval, keeping the history bounded.
    pub fn push_activity(&mut self, interval: ActivityInterval) {
        self.activity.push(interval);
        if self.activity.len() > MAX_ACTIVITY_INTERVALS {
            let excess = self.activity.len() - MAX_ACTIVITY_INTERVALS;
            self.activity.drain(..excess);
        }
    }

    /// Whether this entry is excluded from the active set.
    pub fn is_excluded(&self) -> bool {
        matches!(
            self.offline,
            Some(OfflineInfo {
                reason: AbsenceReason::Excluded,
                ..
            })
        )
    }
}

/// An opaque service endpoint registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Service name.
    pub name: String,
    /// Endpoint addresses, opaque to the membership core.
    pub endpoints: Vec<String>,
}

/// A signed, tiered membership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SporeRecord {
    /// Schema version of this record.
    pub schema_version: u32,
    /// Which tier produced this record.
    pub tier: SporeTier,
    /// The network this record belongs to.
    pub network: NetworkIdentity,
    /// Known node entries, keyed by node id for deterministic order.
    pub nodes: BTreeMap<NodeId, NodeIdentity>,
    /// Service-endpoint registry, opaque to this core.
    pub services: BTreeMap<String, ServiceEndpoint>,
    /// Trust scores as last propagated into this tier.
    pub trust: BTreeMap<NodeId, TrustScore>,
    /// Last update time, unix millis. Monotone within a tier.
    pub last_updated: u64,
    /// Node whose key signed this record.
    pub signer: NodeId,
    /// Ed25519 signature over the canonical content bytes.
    pub signature: Signature,
}

impl SporeRecord {
    /// Build and sign an empty record for a tier.
    pub fn empty(
        tier: SporeTier,
        network: NetworkIdentity,
        keypair: &NodeKeypair,
        now: u64,
    ) -> Result<Self> {
        Self::build(
            tier,
            network,
            BTreeMap::new(),
            BTreeMap::new(),
            BTreeMap::new(),
            now,
            keypair,
        )
    }

    /// Build and sign a record from its contents.
    pub fn build(
        tier: SporeTier,
        network: NetworkIdentity,
        nodes: BTreeMap<NodeId, NodeIdentity>,
        services: BTreeMap<String, ServiceEndpoint>,
        trust: BTreeMap<NodeId, TrustScore>,
        last_updated: u64,
        keypair: &NodeKeypair,
    ) -> Result<Self> {
        let mut record = Self {
            schema_version: SCHEMA_VERSION,
            tier,
            network,
            nodes,
            services,
            trust,
            last_updated,
            signer: keypair.node_id(),
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        record.signature = keypair.sign(&record.signing_bytes()?);
        Ok(record)
    }

    /// Canonical bytes covered by the signature.
    ///
    /// Everything except the signature itself, in bincode's deterministic
    /// encoding (BTreeMaps iterate in key order).
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let content = (
            self.schema_version,
            self.tier,
            &self.network,
            &self.nodes,
            &self.services,
            &self.trust,
            self.last_updated,
            self.signer,
        );
        Ok(bincode::serialize(&content)?)
    }

    /// Verify the record's signature against the given key.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::Schema {
                actual: self.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        let bytes = self.signing_bytes()?;
        key.verify(&bytes, &self.signature)
            .map_err(mycelia_identity::Error::from)?;
        Ok(())
    }

    /// Re-stamp and re-sign after a content change.
    pub fn reseal(&mut self, keypair: &NodeKeypair, now: u64) -> Result<()> {
        // last_updated is monotone within a tier even if the clock stalls
        self.last_updated = now.max(self.last_updated + 1);
        self.signer = keypair.node_id();
        self.signature = keypair.sign(&self.signing_bytes()?);
        Ok(())
    }

    /// Age of this record relative to `now`, in millis.
    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelia_identity::now_millis;

    fn keypair_and_network() -> (NodeKeypair, NetworkIdentity) {
        let kp = NodeKeypair::generate();
        let network = NetworkIdentity::new_genesis("test-net", vec![kp.node_id()]);
        (kp, network)
    }

    #[test]
    fn sign_then_validate_roundtrip() {
        let (kp, network) = keypair_and_network();
        let now = now_millis();

        let mut nodes = BTreeMap::new();
        let entry = NodeIdentity::new(&kp, NodeRole::DedicatedBackbone, vec!["10.0.0.1:7000".into()], now);
        nodes.insert(entry.node_id, entry);

        let mut trust = BTreeMap::new();
        trust.insert(kp.node_id(), TrustScore::clamped(0.5));

        let record = SporeRecord::build(
            SporeTier::Latent,
            network,
            nodes.clone(),
            BTreeMap::new(),
            trust.clone(),
            now,
            &kp,
        )
        .unwrap();

        // Serialized round-trip preserves membership and trust contents
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: SporeRecord = bincode::deserialize(&bytes).unwrap();
        decoded.verify_signature(&kp.verifying_key()).unwrap();
        assert_eq!(decoded.nodes, nodes);
        assert_eq!(decoded.trust, trust);
    }

    #[test]
    fn tampered_record_fails_validation() {
        let (kp, network) = keypair_and_network();
        let mut record = SporeRecord::empty(SporeTier::Latent, network, &kp, 1000).unwrap();

        record.last_updated = 2000; // content changed, signature stale
        assert!(record.verify_signature(&kp.verifying_key()).is_err());
    }

    #[test]
    fn wrong_key_fails_validation() {
        let (kp, network) = keypair_and_network();
        let other = NodeKeypair::generate();
        let record = SporeRecord::empty(SporeTier::Latent, network, &kp, 1000).unwrap();
        assert!(record.verify_signature(&other.verifying_key()).is_err());
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let (kp, network) = keypair_and_network();
        let mut record = SporeRecord::empty(SporeTier::Latent, network, &kp, 1000).unwrap();
        record.schema_version = 99;
        assert!(matches!(
            record.verify_signature(&kp.verifying_key()),
            Err(Error::Schema { actual: 99, .. })
        ));
    }

    #[test]
    fn reseal_is_monotone() {
        let (kp, network) = keypair_and_network();
        let mut record = SporeRecord::empty(SporeTier::Latent, network, &kp, 1000).unwrap();

        // Clock going backwards must not move last_updated backwards
        record.reseal(&kp, 500).unwrap();
        assert!(record.last_updated > 1000);
        record.verify_signature(&kp.verifying_key()).unwrap();
    }

    #[test]
    fn activity_history_is_bounded() {
        let kp = NodeKeypair::generate();
        let mut entry = NodeIdentity::new(&kp, NodeRole::Client, vec![], 0);
        for i in 0..100u64 {
            entry.push_activity(ActivityInterval {
                from: i * 10,
                until: i * 10 + 5,
            });
        }
        assert_eq!(entry.activity.len(), 32);
        // Oldest entries were dropped
        assert_eq!(entry.activity[0].from, 680);
    }

    #[test]
    fn tier_authority_order() {
        assert!(SporeTier::Primary.authority() > SporeTier::Seed.authority());
        assert!(SporeTier::Seed.authority() > SporeTier::Latent.authority());
    }
}
