//! The node runtime: persistent identity, shared state, background tasks,
//! and the external interface of the membership core.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mycelia_consensus::{
    CommitRecord, ConsensusOperation, Engine, EngineHandle, OperationId, Proposal, Resolution,
    RevealRecord, Voter,
};
use mycelia_identity::{now_millis, NetworkIdentity, NodeId, NodeKeypair, NodeRole};
use mycelia_spore::{
    gossip, GossipMessage, LogCommand, NodeIdentity, PrimaryLog, RegistrationRequest, SeedStore,
    SporeTier, SporeView,
};
use mycelia_trust::{TrustEvent, TrustTable};

use crate::config::NodeConfig;
use crate::error::Result;

/// Proposals kept awaiting finalization before the oldest are dropped.
const MAX_PENDING_PROPOSALS: usize = 1024;

/// One running node of the membership core.
///
/// Owns the merged spore view and the trust table behind `RwLock`s; the
/// consensus engine runs as its own task and is reached through its handle.
/// All trust mutation flows through the table, all membership mutation
/// through the view.
pub struct Node {
    config: NodeConfig,
    keypair: NodeKeypair,
    network: NetworkIdentity,
    view: Arc<RwLock<SporeView>>,
    trust: Arc<RwLock<TrustTable>>,
    primary: Arc<RwLock<PrimaryLog>>,
    seeds: Arc<SeedStore>,
    engine: EngineHandle,
    /// Operations this node proposed, for applying effects at resolution.
    proposed: Arc<RwLock<BTreeMap<OperationId, ConsensusOperation>>>,
}

impl Node {
    /// Bring up a node from its data directory.
    ///
    /// Creates the keypair and a genesis network identity on first start;
    /// subsequent starts reload them, replay the primary log, and recover
    /// the latest seed snapshot.
    pub fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let keypair = load_or_generate_keypair(&config)?;
        let node_id = keypair.node_id();
        let network = load_or_create_network(&config, node_id)?;
        info!(node = %node_id, network = %network.network_name, "node identity ready");

        let mut trust = if config.trust_path().exists() {
            TrustTable::load(config.trust_path())?
        } else {
            TrustTable::new(config.trust)
        };
        let own_score = trust.admit(node_id);

        let now = now_millis();
        let mut view = SporeView::new(network.clone(), keypair.clone(), config.merge, now)?;

        // Announce ourselves in our own Latent record
        let role = if network.is_genesis_node(&node_id) {
            NodeRole::DedicatedBackbone
        } else {
            NodeRole::SemiNode {
                promotion_eligible: true,
            }
        };
        let entry = NodeIdentity::new(&keypair, role, config.addresses.clone(), now);
        let proof = keypair.membership_proof(&network);
        let signature = keypair.sign(&proof);
        view.register_node(
            RegistrationRequest {
                network: network.clone(),
                entry,
                proof,
                signature,
            },
            now,
        )?;
        let mut own = BTreeMap::new();
        own.insert(node_id, own_score);
        view.apply_trust_updates(&own, now)?;

        let seeds = SeedStore::open(config.seed_dir())?;
        if let Some(snapshot) = seeds.load_latest()? {
            match view.ingest(snapshot) {
                Ok(_) => debug!("seed snapshot recovered"),
                Err(err) => warn!(%err, "seed snapshot not ingestible, continuing without"),
            }
        }

        let primary = PrimaryLog::open(
            network.clone(),
            keypair.clone(),
            config.primary_log_path(),
        )?;
        if primary.next_index() > 0 {
            match view.ingest(primary.materialize(now)?) {
                Ok(_) => debug!("primary log state recovered"),
                Err(err) => warn!(%err, "primary state not ingestible, continuing without"),
            }
        }

        let (engine, trust_rx) = Engine::spawn(config.engine);

        let node = Self {
            config,
            keypair,
            network,
            view: Arc::new(RwLock::new(view)),
            trust: Arc::new(RwLock::new(trust)),
            primary: Arc::new(RwLock::new(primary)),
            seeds: Arc::new(seeds),
            engine,
            proposed: Arc::new(RwLock::new(BTreeMap::new())),
        };
        node.spawn_trust_pump(trust_rx);
        Ok(node)
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    /// This node's network identity.
    pub fn network(&self) -> &NetworkIdentity {
        &self.network
    }

    /// Register a node submitted by the network.
    pub async fn register_node(&self, request: RegistrationRequest) -> Result<()> {
        let now = now_millis();
        let node = request.entry.node_id;
        {
            let mut view = self.view.write().await;
            view.register_node(request, now)?;
        }
        let score = {
            let mut trust = self.trust.write().await;
            trust.admit(node)
        };
        let mut updates = BTreeMap::new();
        updates.insert(node, score);
        self.view.write().await.apply_trust_updates(&updates, now)?;
        Ok(())
    }

    /// The current merged active-node list, ordered by node id.
    pub async fn get_active_nodes(&self) -> Vec<NodeIdentity> {
        self.view.read().await.get_active_nodes()
    }

    /// Validate a claimed network identity against ours.
    pub async fn validate_network_identity(&self, claim: &NetworkIdentity) -> bool {
        self.view.read().await.validate_network_identity(claim)
    }

    /// Apply a batch of consensus-derived trust events.
    pub async fn update_trust_scores(&self, events: &[(NodeId, TrustEvent)]) -> Result<()> {
        let now = now_millis();
        let mut updates = BTreeMap::new();
        {
            let mut trust = self.trust.write().await;
            for (node, event) in events {
                updates.insert(*node, trust.record_event(*node, *event, now));
            }
        }
        self.view.write().await.apply_trust_updates(&updates, now)?;
        Ok(())
    }

    /// Propose an operation for consensus. Returns the fresh operation id.
    pub async fn propose_operation(&self, operation: ConsensusOperation) -> Result<OperationId> {
        let eligible = self.eligible_voters(&operation).await;
        let proposal = Proposal {
            id: OperationId::random(),
            proposer: self.node_id(),
            operation: operation.clone(),
            proposed_at: now_millis(),
        };
        let id = proposal.id;
        self.engine.propose(proposal, eligible).await?;
        let mut proposed = self.proposed.write().await;
        proposed.insert(id, operation);
        // Ids are random, so eviction order is arbitrary; the cap only
        // bounds proposals that were never finalized.
        while proposed.len() > MAX_PENDING_PROPOSALS {
            proposed.pop_first();
        }
        Ok(id)
    }

    /// Submit a commit for an open round.
    pub async fn commit(&self, commit: CommitRecord) -> Result<()> {
        Ok(self.engine.commit(commit).await?)
    }

    /// Submit a reveal for a round in its reveal phase.
    pub async fn reveal(&self, reveal: RevealRecord) -> Result<()> {
        Ok(self.engine.reveal(reveal).await?)
    }

    /// The resolution of an operation, if it has resolved.
    pub async fn get_consensus_result(&self, operation: OperationId) -> Result<Option<Resolution>> {
        Ok(self.engine.get_result(operation).await?)
    }

    /// Fetch an operation's resolution and, when it committed with approval,
    /// apply its membership effects and append it to the primary log.
    pub async fn finalize_operation(&self, id: OperationId) -> Result<Option<Resolution>> {
        let Some(resolution) = self.engine.get_result(id).await? else {
            return Ok(None);
        };
        let Some(operation) = self.proposed.write().await.remove(&id) else {
            return Ok(Some(resolution));
        };

        if let Resolution::Committed(winner) = &resolution {
            if winner.as_slice() == b"approve" {
                self.apply_committed(&operation).await?;
            }
        }
        Ok(Some(resolution))
    }

    async fn apply_committed(&self, operation: &ConsensusOperation) -> Result<()> {
        let now = now_millis();
        match operation {
            ConsensusOperation::NodeExclusion { node } => {
                self.view.write().await.apply_exclusion(*node, now)?;
                self.trust.write().await.remove(node);
                self.primary
                    .write()
                    .await
                    .append(self.node_id(), LogCommand::RemoveNode(*node), now)?;
                info!(node = %node, "exclusion applied");
            }
            ConsensusOperation::NodeAdmission { node } => {
                let entry = self.view.read().await.merged().get(node).cloned();
                if let Some(entry) = entry {
                    self.primary
                        .write()
                        .await
                        .append(self.node_id(), LogCommand::UpsertNode(entry), now)?;
                }
                info!(node = %node, "admission recorded in primary log");
            }
            ConsensusOperation::TrustScoreModification { node, proposed } => {
                let mut updates = BTreeMap::new();
                updates.insert(*node, *proposed);
                self.view.write().await.apply_trust_updates(&updates, now)?;
                self.primary.write().await.append(
                    self.node_id(),
                    LogCommand::SetTrust {
                        node: *node,
                        score: *proposed,
                    },
                    now,
                )?;
            }
            // Config values and service registries are opaque to the
            // membership core; their effects live with their owners.
            ConsensusOperation::NetworkConfigurationChange { .. }
            | ConsensusOperation::ServiceDeploymentDecision { .. } => {}
        }
        Ok(())
    }

    /// Produce this node's gossip digest for the anti-entropy exchange.
    pub async fn gossip_digest(&self) -> Result<Option<GossipMessage>> {
        Ok(gossip::digest(&*self.view.read().await)?)
    }

    /// Handle one incoming gossip message, producing at most one reply.
    pub async fn handle_gossip(&self, message: GossipMessage) -> Result<Option<GossipMessage>> {
        Ok(gossip::handle(&mut *self.view.write().await, message)?)
    }

    /// Write a seed snapshot of the current authoritative record.
    pub async fn write_seed_snapshot(&self) -> Result<()> {
        let record = {
            let view = self.view.read().await;
            view.authoritative().map(|(_, record)| record.clone())
        };
        if let Some(mut record) = record {
            record.tier = SporeTier::Seed;
            record.reseal(&self.keypair, now_millis())?;
            self.seeds.write_snapshot(&record)?;
        }
        Ok(())
    }

    /// Persist the trust table.
    pub async fn persist_trust(&self) -> Result<()> {
        self.trust.read().await.save(self.config.trust_path())?;
        Ok(())
    }

    async fn eligible_voters(&self, operation: &ConsensusOperation) -> BTreeMap<NodeId, Voter> {
        let floor = {
            let trust = self.trust.read().await;
            trust.config().eligibility_floor
        };
        let min_trust = floor.max(operation.required_trust());
        self.view
            .read()
            .await
            .merged()
            .into_values()
            .filter(|entry| {
                !entry.is_excluded()
                    && entry.role.participates_in_consensus()
                    && entry.trust.meets(min_trust)
            })
            .map(|entry| {
                (
                    entry.node_id,
                    Voter {
                        trust: entry.trust,
                        key: entry.verifying_key,
                    },
                )
            })
            .collect()
    }

    /// Route trust evidence from resolved rounds into the table and back
    /// into the spore view.
    fn spawn_trust_pump(
        &self,
        mut trust_rx: tokio::sync::mpsc::UnboundedReceiver<(NodeId, TrustEvent)>,
    ) {
        let trust = Arc::clone(&self.trust);
        let view = Arc::clone(&self.view);
        tokio::spawn(async move {
            while let Some((node, event)) = trust_rx.recv().await {
                let now = now_millis();
                let score = trust.write().await.record_event(node, event, now);
                let mut updates = BTreeMap::new();
                updates.insert(node, score);
                if let Err(err) = view.write().await.apply_trust_updates(&updates, now) {
                    warn!(%err, "failed to propagate trust update into spore view");
                }
            }
            debug!("trust pump stopped");
        });
    }

    fn spawn_snapshot_task(&self) {
        let view = Arc::clone(&self.view);
        let seeds = Arc::clone(&self.seeds);
        let keypair = self.keypair.clone();
        let interval = Duration::from_millis(self.config.snapshot_interval_millis);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let record = {
                    let view = view.read().await;
                    view.authoritative().map(|(_, record)| record.clone())
                };
                if let Some(mut record) = record {
                    record.tier = SporeTier::Seed;
                    if record.reseal(&keypair, now_millis()).is_ok() {
                        if let Err(err) = seeds.write_snapshot(&record) {
                            warn!(%err, "seed snapshot failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_decay_sweep(&self) {
        let view = Arc::clone(&self.view);
        let trust = Arc::clone(&self.trust);
        let interval = Duration::from_millis(self.config.decay_sweep_interval_millis);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = now_millis();
                let entries: Vec<(NodeId, u64)> = {
                    let view = view.read().await;
                    view.merged()
                        .values()
                        .map(|entry| (entry.node_id, entry.last_seen))
                        .collect()
                };
                let mut updates = BTreeMap::new();
                {
                    let mut trust = trust.write().await;
                    for (node, last_seen) in entries {
                        updates.insert(node, trust.apply_idle_decay(node, last_seen, now));
                    }
                }
                if let Err(err) = view.write().await.apply_trust_updates(&updates, now) {
                    warn!(%err, "failed to apply decayed scores to spore view");
                }
            }
        });
    }

    /// Run the node until interrupted, then persist state.
    pub async fn run(&self) -> Result<()> {
        self.spawn_snapshot_task();
        self.spawn_decay_sweep();
        info!(node = %self.node_id(), "node running");

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        self.write_seed_snapshot().await?;
        self.persist_trust().await?;
        Ok(())
    }
}

fn load_or_generate_keypair(config: &NodeConfig) -> Result<NodeKeypair> {
    let path = config.keypair_path();
    if path.exists() {
        let encoded = std::fs::read_to_string(&path)?;
        let bytes = hex::decode(encoded.trim()).map_err(mycelia_identity::Error::from)?;
        let secret: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| mycelia_identity::Error::Length {
                    what: "node key",
                    expected: 32,
                    actual: bytes.len(),
                })?;
        return Ok(NodeKeypair::from_secret_bytes(&secret));
    }
    let keypair = NodeKeypair::generate();
    std::fs::write(&path, hex::encode(keypair.secret_bytes()))?;
    Ok(keypair)
}

fn load_or_create_network(config: &NodeConfig, node_id: NodeId) -> Result<NetworkIdentity> {
    let path = config.network_path();
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let network = NetworkIdentity::new_genesis(&config.network_name, vec![node_id]);
    std::fs::write(&path, serde_json::to_vec_pretty(&network)?)?;
    info!(network = %network.network_name, "genesis network created");
    Ok(network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycelia_consensus::fresh_nonce;
    use mycelia_trust::TrustScore;

    fn test_config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::from_env();
        config.data_dir = dir.to_path_buf();
        config.network_name = "node-test".into();
        config.addresses = vec!["127.0.0.1:7001".into()];
        config
    }

    #[tokio::test]
    async fn bootstrap_announces_self() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        let active = node.get_active_nodes().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].node_id, node.node_id());
        assert!(active[0].role.is_backbone());
    }

    #[tokio::test]
    async fn identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let first_id = {
            let node = Node::new(config.clone()).unwrap();
            node.node_id()
        };
        let node = Node::new(config).unwrap();
        assert_eq!(node.node_id(), first_id);
    }

    #[tokio::test]
    async fn registration_and_trust_flow() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();

        let member = NodeKeypair::generate();
        let entry = NodeIdentity::new(
            &member,
            NodeRole::DedicatedBackbone,
            vec![],
            now_millis(),
        );
        let proof = member.membership_proof(node.network());
        let signature = member.sign(&proof);
        node.register_node(RegistrationRequest {
            network: node.network().clone(),
            entry,
            proof,
            signature,
        })
        .await
        .unwrap();

        let active = node.get_active_nodes().await;
        assert_eq!(active.len(), 2);

        // Admission seeds the configured initial score, not the floor
        let member_entry = active
            .iter()
            .find(|e| e.node_id == member.node_id())
            .unwrap();
        assert_eq!(member_entry.trust.value(), 0.35);
    }

    #[tokio::test]
    async fn foreign_network_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        let foreign = NetworkIdentity::new_genesis("other-net", vec![]);
        assert!(!node.validate_network_identity(&foreign).await);
        assert!(node.validate_network_identity(node.network()).await);
    }

    #[tokio::test]
    async fn proposal_below_quorum_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();
        // Only this node exists and its trust (0.35) is below the admission
        // threshold anyway
        let result = node
            .propose_operation(ConsensusOperation::NodeAdmission {
                node: NodeId::from_bytes([5u8; 32]),
            })
            .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Consensus(
                mycelia_consensus::Error::Quorum { .. }
            ))
        ));
    }

    async fn register_backbone(node: &Node, trust: f64) -> NodeKeypair {
        let member = NodeKeypair::generate();
        let entry = NodeIdentity::new(
            &member,
            NodeRole::DedicatedBackbone,
            vec![],
            now_millis(),
        );
        let proof = member.membership_proof(node.network());
        let signature = member.sign(&proof);
        node.register_node(RegistrationRequest {
            network: node.network().clone(),
            entry,
            proof,
            signature,
        })
        .await
        .unwrap();

        let mut updates = BTreeMap::new();
        updates.insert(member.node_id(), TrustScore::clamped(trust));
        node.view
            .write()
            .await
            .apply_trust_updates(&updates, now_millis())
            .unwrap();
        member
    }

    #[tokio::test]
    async fn pending_proposals_are_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();

        // Service decisions resolve without quorum, so they can pile up
        // awaiting finalization
        for i in 0..(MAX_PENDING_PROPOSALS + 5) {
            node.propose_operation(ConsensusOperation::ServiceDeploymentDecision {
                service: format!("svc-{i}"),
                issuer_tier: SporeTier::Latent,
                deploy: true,
            })
            .await
            .unwrap();
        }
        assert_eq!(node.proposed.read().await.len(), MAX_PENDING_PROPOSALS);
    }

    #[tokio::test]
    async fn full_consensus_through_node_api() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::new(test_config(dir.path())).unwrap();

        let voters = [
            register_backbone(&node, 0.9).await,
            register_backbone(&node, 0.9).await,
            register_backbone(&node, 0.9).await,
        ];

        let subject = register_backbone(&node, 0.1).await;
        let id = node
            .propose_operation(ConsensusOperation::NodeExclusion {
                node: subject.node_id(),
            })
            .await
            .unwrap();

        for kp in &voters {
            let nonce = fresh_nonce();
            let commit =
                CommitRecord::sign(kp, id, b"approve", &nonce, now_millis()).unwrap();
            node.commit(commit).await.unwrap();
            let reveal =
                RevealRecord::sign(kp, id, b"approve".to_vec(), nonce, now_millis()).unwrap();
            node.reveal(reveal).await.unwrap();
        }

        let resolution = node.finalize_operation(id).await.unwrap();
        assert_eq!(resolution, Some(Resolution::Committed(b"approve".to_vec())));

        // The excluded node left the active set
        let active = node.get_active_nodes().await;
        assert!(active.iter().all(|e| e.node_id != subject.node_id()));
    }
}
