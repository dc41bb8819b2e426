//! The locally held, merged spore view.
//!
//! A [`SporeView`] owns the node's copy of all three tier records and is the
//! only place they are mutated. Everything the rest of the core wants to
//! know about membership - the active node list, voter eligibility, whose
//! key may sign what - is answered from here, through the merge rules in
//! [`crate::merge`].

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mycelia_identity::{NetworkIdentity, NodeId, NodeKeypair, NodeRole};
use mycelia_trust::TrustScore;

use crate::error::{Error, Result};
use crate::merge::{merge_within_tier, merged_entries, select_authoritative, MergeConfig};
use crate::record::{AbsenceReason, NodeIdentity, OfflineInfo, SporeRecord, SporeTier};

/// A node's request to join the network.
///
/// The submitting node signs its membership proof with its own key; the
/// proof itself binds the key to the network's isolation key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// The network the node claims to join.
    pub network: NetworkIdentity,
    /// The node's membership entry.
    pub entry: NodeIdentity,
    /// Membership proof: blake3(isolation_key ‖ verifying_key).
    pub proof: [u8; 32],
    /// Signature over the proof by the node's key.
    pub signature: Signature,
}

/// The locally held three-tier membership view.
pub struct SporeView {
    network: NetworkIdentity,
    keypair: NodeKeypair,
    config: MergeConfig,
    tiers: [(SporeTier, Option<SporeRecord>); 3],
}

impl SporeView {
    /// Create a view for a network with an empty Latent record.
    ///
    /// The Latent tier is the one this node itself produces and gossips;
    /// Primary and Seed records arrive through [`SporeView::ingest`].
    pub fn new(
        network: NetworkIdentity,
        keypair: NodeKeypair,
        config: MergeConfig,
        now: u64,
    ) -> Result<Self> {
        let latent = SporeRecord::empty(SporeTier::Latent, network.clone(), &keypair, now)?;
        Ok(Self {
            network,
            keypair,
            config,
            tiers: [
                (SporeTier::Primary, None),
                (SporeTier::Seed, None),
                (SporeTier::Latent, Some(latent)),
            ],
        })
    }

    /// The network this view belongs to.
    pub fn network(&self) -> &NetworkIdentity {
        &self.network
    }

    /// The record currently held for a tier.
    pub fn record(&self, tier: SporeTier) -> Option<&SporeRecord> {
        self.tiers
            .iter()
            .find(|(t, _)| *t == tier)
            .and_then(|(_, slot)| slot.as_ref())
    }

    fn slot_mut(&mut self, tier: SporeTier) -> &mut Option<SporeRecord> {
        &mut self
            .tiers
            .iter_mut()
            .find(|(t, _)| *t == tier)
            .expect("all tiers present by construction")
            .1
    }

    /// Whether a node's key is authorized to sign records for this network.
    ///
    /// Genesis nodes are authorized from birth; afterwards, any node holding
    /// a backbone role in the merged view is. Keys are self-certifying
    /// (node id = blake3(key)), so possession of the id pins the key.
    pub fn is_authorized_signer(&self, signer: &NodeId) -> bool {
        if self.network.is_genesis_node(signer) {
            return true;
        }
        self.merged()
            .get(signer)
            .map(|entry| entry.role.is_backbone())
            .unwrap_or(false)
    }

    /// Look up a signer's verifying key, preferring the merged view and
    /// falling back to the incoming record's own self-certifying entry.
    fn signer_key(&self, record: &SporeRecord) -> Option<VerifyingKey> {
        if let Some(entry) = self.merged().get(&record.signer) {
            return Some(entry.verifying_key);
        }
        record.nodes.get(&record.signer).and_then(|entry| {
            // Self-certifying check: the embedded key must hash to the id
            (NodeId::from_verifying_key(&entry.verifying_key) == record.signer)
                .then_some(entry.verifying_key)
        })
    }

    /// Ingest a record into its tier.
    ///
    /// Validates isolation, signer authorization, and the signature before
    /// applying the within-tier merge. Returns true if the tier record was
    /// replaced. An older record is not an error - it simply loses.
    pub fn ingest(&mut self, record: SporeRecord) -> Result<bool> {
        self.network.validate_claim(&record.network)?;

        if !self.is_authorized_signer(&record.signer) {
            warn!(signer = %record.signer, tier = %record.tier, "record from unauthorized signer rejected");
            return Err(Error::UnauthorizedSigner {
                signer: record.signer.to_hex(),
            });
        }

        let key = self
            .signer_key(&record)
            .ok_or_else(|| Error::UnauthorizedSigner {
                signer: record.signer.to_hex(),
            })?;
        record.verify_signature(&key)?;

        let tier = record.tier;
        let replaced = merge_within_tier(self.slot_mut(tier), record);
        debug!(tier = %tier, replaced, "record ingested");
        Ok(replaced)
    }

    /// Register a node into the Latent record this node produces.
    ///
    /// Fails with an identity error if the proof or signature does not
    /// validate, or an isolation error if the claim names another network.
    /// The submitted trust value and any claimed backbone role are ignored:
    /// admission always starts at the floor as a semi-node, and only
    /// consensus raises either.
    pub fn register_node(&mut self, request: RegistrationRequest, now: u64) -> Result<()> {
        self.network.validate_claim(&request.network)?;

        let mut entry = request.entry;
        if NodeId::from_verifying_key(&entry.verifying_key) != entry.node_id {
            return Err(mycelia_identity::Error::InvalidProof {
                network: self.network.network_name.clone(),
            }
            .into());
        }
        self.network
            .validate_membership(&request.proof, &request.signature, &entry.verifying_key)?;

        // Roles are granted through consensus, never self-declared. A
        // backbone role in the merged view carries signing authority, so a
        // non-genesis joiner is admitted as a semi-node whatever it claims.
        if entry.role.is_backbone() && !self.network.is_genesis_node(&entry.node_id) {
            debug!(node = %entry.node_id, claimed = %entry.role, "backbone claim demoted at admission");
            entry.role = NodeRole::SemiNode {
                promotion_eligible: true,
            };
        }

        entry.trust = TrustScore::MIN;
        entry.last_seen = now;

        let keypair = self.keypair.clone();
        let latent = self
            .slot_mut(SporeTier::Latent)
            .as_mut()
            .expect("latent record exists by construction");
        info!(node = %entry.node_id, role = %entry.role, "node registered");
        latent.nodes.insert(entry.node_id, entry);
        latent.reseal(&keypair, now)?;
        Ok(())
    }

    /// Validate a claimed network identity.
    pub fn validate_network_identity(&self, claim: &NetworkIdentity) -> bool {
        self.network.validate_claim(claim).is_ok()
    }

    /// The merged per-entity view across all tiers.
    pub fn merged(&self) -> BTreeMap<NodeId, NodeIdentity> {
        merged_entries(&self.tiers, &self.config)
    }

    /// The authoritative record under the tier fallback rule.
    pub fn authoritative(&self) -> Option<(SporeTier, &SporeRecord)> {
        select_authoritative(&self.tiers, &self.config)
    }

    /// Current merged active-node list, ordered by node id.
    ///
    /// Excluded nodes are filtered out; everything else is "active" in the
    /// best-effort sense the discovery layer can offer.
    pub fn get_active_nodes(&self) -> Vec<NodeIdentity> {
        self.merged()
            .into_values()
            .filter(|entry| !entry.is_excluded())
            .collect()
    }

    /// Nodes eligible to vote on an operation requiring `min_trust`.
    pub fn eligible_voters(&self, min_trust: f64) -> Vec<(NodeId, TrustScore)> {
        self.merged()
            .values()
            .filter(|entry| {
                !entry.is_excluded()
                    && entry.role.participates_in_consensus()
                    && entry.trust.meets(min_trust)
            })
            .map(|entry| (entry.node_id, entry.trust))
            .collect()
    }

    /// Apply a batch of trust updates into the Latent record.
    ///
    /// Called by the runtime after the trust subsystem has recomputed
    /// scores; updated trust then propagates on the next gossip cycle.
    pub fn apply_trust_updates(
        &mut self,
        updates: &BTreeMap<NodeId, TrustScore>,
        now: u64,
    ) -> Result<()> {
        let keypair = self.keypair.clone();
        let latent = self
            .slot_mut(SporeTier::Latent)
            .as_mut()
            .expect("latent record exists by construction");

        for (node, score) in updates {
            latent.trust.insert(*node, *score);
            if let Some(entry) = latent.nodes.get_mut(node) {
                entry.trust = *score;
            }
        }
        latent.reseal(&keypair, now)?;
        debug!(count = updates.len(), "trust updates applied to latent tier");
        Ok(())
    }

    /// Mark a node excluded, as the effect of a resolved exclusion.
    pub fn apply_exclusion(&mut self, node: NodeId, now: u64) -> Result<()> {
        let keypair = self.keypair.clone();
        let latent = self
            .slot_mut(SporeTier::Latent)
            .as_mut()
            .expect("latent record exists by construction");

        if let Some(entry) = latent.nodes.get_mut(&node) {
            entry.offline = Some(OfflineInfo {
                since: now,
                reason: AbsenceReason::Excluded,
            });
            warn!(node = %node, "node excluded from active set");
        }
        latent.reseal(&keypair, now)?;
        Ok(())
    }

    /// Refresh a node's last-seen timestamp in the Latent record.
    pub fn touch(&mut self, node: NodeId, now: u64) -> Result<()> {
        let keypair = self.keypair.clone();
        let latent = self
            .slot_mut(SporeTier::Latent)
            .as_mut()
            .expect("latent record exists by construction");
        if let Some(entry) = latent.nodes.get_mut(&node) {
            entry.last_seen = now;
            entry.offline = None;
            latent.reseal(&keypair, now)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SporeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SporeView")
            .field("network", &self.network.network_name)
            .field("nodes", &self.merged().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelia_identity::{now_millis, NodeRole};

    fn genesis_view() -> (SporeView, NodeKeypair, NetworkIdentity) {
        let kp = NodeKeypair::generate();
        let network = NetworkIdentity::new_genesis("test-net", vec![kp.node_id()]);
        let view = SporeView::new(
            network.clone(),
            kp.clone(),
            MergeConfig::default(),
            now_millis(),
        )
        .unwrap();
        (view, kp, network)
    }

    fn registration(network: &NetworkIdentity, role: NodeRole) -> (RegistrationRequest, NodeKeypair) {
        let kp = NodeKeypair::generate();
        let entry = NodeIdentity::new(&kp, role, vec!["10.0.0.5:7000".into()], now_millis());
        let proof = kp.membership_proof(network);
        let signature = kp.sign(&proof);
        (
            RegistrationRequest {
                network: network.clone(),
                entry,
                proof,
                signature,
            },
            kp,
        )
    }

    #[test]
    fn register_and_list() {
        let (mut view, _kp, network) = genesis_view();
        let (request, kp2) = registration(&network, NodeRole::SemiNode { promotion_eligible: true });

        view.register_node(request, now_millis()).unwrap();

        let active = view.get_active_nodes();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, kp2.node_id());
        // Admission always starts at the floor
        assert_eq!(active[0].trust, TrustScore::MIN);
    }

    #[test]
    fn registration_cannot_claim_backbone() {
        let (mut view, _kp, network) = genesis_view();
        let (request, kp2) = registration(&network, NodeRole::DedicatedBackbone);

        view.register_node(request, now_millis()).unwrap();

        // Admitted as a semi-node regardless of the declared role
        let active = view.get_active_nodes();
        assert_eq!(active.len(), 1);
        assert!(!active[0].role.is_backbone());
        assert_eq!(
            active[0].role,
            NodeRole::SemiNode {
                promotion_eligible: true
            }
        );
        // So the joiner holds no record-signing authority either
        assert!(!view.is_authorized_signer(&kp2.node_id()));
    }

    #[test]
    fn register_rejects_foreign_network() {
        let (mut view, _kp, _network) = genesis_view();
        let foreign = NetworkIdentity::new_genesis("foreign", vec![]);
        let (request, _) = registration(&foreign, NodeRole::Client);

        assert!(matches!(
            view.register_node(request, now_millis()),
            Err(Error::Identity(mycelia_identity::Error::Isolation { .. }))
        ));
    }

    #[test]
    fn register_rejects_bad_proof() {
        let (mut view, _kp, network) = genesis_view();
        let (mut request, _) = registration(&network, NodeRole::Client);
        request.proof = [0u8; 32];

        assert!(view.register_node(request, now_millis()).is_err());
    }

    #[test]
    fn register_rejects_mismatched_key_and_id() {
        let (mut view, _kp, network) = genesis_view();
        let (mut request, _) = registration(&network, NodeRole::Client);
        request.entry.node_id = NodeId::from_bytes([9u8; 32]);

        assert!(view.register_node(request, now_millis()).is_err());
    }

    #[test]
    fn ingest_requires_authorized_signer() {
        let (mut view, _kp, network) = genesis_view();

        let stranger = NodeKeypair::generate();
        let record =
            SporeRecord::empty(SporeTier::Seed, network, &stranger, now_millis()).unwrap();

        assert!(matches!(
            view.ingest(record),
            Err(Error::UnauthorizedSigner { .. })
        ));
    }

    #[test]
    fn ingest_accepts_genesis_signer() {
        let (mut view, kp, network) = genesis_view();
        let record = SporeRecord::empty(SporeTier::Seed, network, &kp, now_millis()).unwrap();
        assert!(view.ingest(record).unwrap());
    }

    #[test]
    fn ingest_rejects_cross_network_record() {
        let (mut view, kp, _network) = genesis_view();
        let foreign = NetworkIdentity::new_genesis("foreign", vec![kp.node_id()]);
        let record = SporeRecord::empty(SporeTier::Seed, foreign, &kp, now_millis()).unwrap();

        assert!(matches!(
            view.ingest(record),
            Err(Error::Identity(mycelia_identity::Error::Isolation { .. }))
        ));
    }

    #[test]
    fn older_record_loses_quietly() {
        let (mut view, kp, network) = genesis_view();

        let newer = SporeRecord::empty(SporeTier::Seed, network.clone(), &kp, 2_000).unwrap();
        let older = SporeRecord::empty(SporeTier::Seed, network, &kp, 1_000).unwrap();

        assert!(view.ingest(newer).unwrap());
        assert!(!view.ingest(older).unwrap());
        assert_eq!(view.record(SporeTier::Seed).unwrap().last_updated, 2_000);
    }

    #[test]
    fn trust_updates_flow_into_latent() {
        let (mut view, _kp, network) = genesis_view();
        let (request, kp2) = registration(&network, NodeRole::DedicatedBackbone);
        view.register_node(request, now_millis()).unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(kp2.node_id(), TrustScore::clamped(0.8));
        view.apply_trust_updates(&updates, now_millis()).unwrap();

        let active = view.get_active_nodes();
        assert_eq!(active[0].trust.value(), 0.8);
    }

    #[test]
    fn excluded_nodes_leave_active_set() {
        let (mut view, _kp, network) = genesis_view();
        let (request, kp2) = registration(&network, NodeRole::Client);
        view.register_node(request, now_millis()).unwrap();
        assert_eq!(view.get_active_nodes().len(), 1);

        view.apply_exclusion(kp2.node_id(), now_millis()).unwrap();
        assert!(view.get_active_nodes().is_empty());
    }

    #[test]
    fn eligible_voters_respects_role_and_trust() {
        let (mut view, _kp, network) = genesis_view();

        let (backbone_req, backbone_kp) = registration(&network, NodeRole::DedicatedBackbone);
        let (client_req, _client_kp) = registration(&network, NodeRole::Client);
        view.register_node(backbone_req, now_millis()).unwrap();
        view.register_node(client_req, now_millis()).unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(backbone_kp.node_id(), TrustScore::clamped(0.9));
        view.apply_trust_updates(&updates, now_millis()).unwrap();

        let voters = view.eligible_voters(0.5);
        assert_eq!(voters.len(), 1);
        assert_eq!(voters[0].0, backbone_kp.node_id());

        // Raise the bar above the backbone's trust
        assert!(view.eligible_voters(0.95).is_empty());
    }
}
