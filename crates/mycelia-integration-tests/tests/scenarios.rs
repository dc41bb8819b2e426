//! End-to-end scenarios across the discovery, trust, and consensus crates.

use std::collections::BTreeMap;

use mycelia_consensus::{
    fresh_nonce, CommitRecord, ConsensusOperation, Engine, EngineConfig, Error as ConsensusError,
    OperationId, Proposal, Resolution, RevealRecord, RoundConfig, Voter,
};
use mycelia_identity::{now_millis, NetworkIdentity, NodeId, NodeKeypair, NodeRole};
use mycelia_spore::{MergeConfig, NodeIdentity, SporeRecord, SporeTier, SporeView};
use mycelia_trust::{TrustConfig, TrustScore, TrustTable};

fn backbone_voters(trusts: &[f64]) -> (Vec<NodeKeypair>, BTreeMap<NodeId, Voter>) {
    let keypairs: Vec<NodeKeypair> = trusts.iter().map(|_| NodeKeypair::generate()).collect();
    let eligible = keypairs
        .iter()
        .zip(trusts)
        .map(|(kp, trust)| {
            (
                kp.node_id(),
                Voter {
                    trust: TrustScore::clamped(*trust),
                    key: kp.verifying_key(),
                },
            )
        })
        .collect();
    (keypairs, eligible)
}

fn admission_proposal(proposer: NodeId, subject: [u8; 32]) -> Proposal {
    Proposal {
        id: OperationId::random(),
        proposer,
        operation: ConsensusOperation::NodeAdmission {
            node: NodeId::from_bytes(subject),
        },
        proposed_at: now_millis(),
    }
}

async fn run_votes(
    handle: &mycelia_consensus::EngineHandle,
    keypairs: &[NodeKeypair],
    operation: OperationId,
    values: &[&[u8]],
) {
    let mut nonces = Vec::new();
    for (kp, value) in keypairs.iter().zip(values) {
        let nonce = fresh_nonce();
        let commit = CommitRecord::sign(kp, operation, value, &nonce, now_millis()).unwrap();
        handle.commit(commit).await.unwrap();
        nonces.push(nonce);
    }
    for ((kp, value), nonce) in keypairs.iter().zip(values).zip(nonces) {
        let reveal =
            RevealRecord::sign(kp, operation, value.to_vec(), nonce, now_millis()).unwrap();
        handle.reveal(reveal).await.unwrap();
    }
}

/// Four backbones with trust [0.9, 0.9, 0.9, 0.1]; three agree and one
/// deviates. The majority result commits, and repeated deviation drives the
/// fourth node under the eligibility floor.
#[tokio::test]
async fn deviating_backbone_sinks_to_the_floor() {
    let (handle, mut trust_rx) = Engine::spawn(EngineConfig::default());
    let (keypairs, eligible) = backbone_voters(&[0.9, 0.9, 0.9, 0.1]);
    let deviant = keypairs[3].node_id();

    let mut table = TrustTable::new(TrustConfig::default());
    for kp in &keypairs {
        table.admit(kp.node_id());
    }
    // The deviant starts just above the floor
    table.record_event(deviant, mycelia_trust::TrustEvent::NonParticipation, 0);
    let start = table.score(&deviant).unwrap();

    for round in 0..4u8 {
        let proposal = admission_proposal(keypairs[0].node_id(), [round + 1; 32]);
        let id = proposal.id;
        handle.propose(proposal, eligible.clone()).await.unwrap();
        run_votes(&handle, &keypairs, id, &[b"approve", b"approve", b"approve", b"deny"]).await;

        assert_eq!(
            handle.get_result(id).await.unwrap(),
            Some(Resolution::Committed(b"approve".to_vec()))
        );
        while let Ok((node, event)) = trust_rx.try_recv() {
            table.record_event(node, event, now_millis());
        }
    }

    let end = table.score(&deviant).unwrap();
    assert!(end.value() < start.value());
    // Four losing reveals at -0.05 from 0.33 put it under the 0.2 floor
    assert!(!table.is_eligible(&deviant));
    // The agreeing majority climbed
    assert!(table.score(&keypairs[0].node_id()).unwrap().value() > 0.35);
}

/// Primary unreachable; the Seed record is 2 minutes old and Latent 10
/// seconds old. Within the staleness bound the higher-authority Seed wins.
#[test]
fn seed_beats_fresher_latent_within_staleness_bound() {
    let kp = NodeKeypair::generate();
    let network = NetworkIdentity::new_genesis("fallback-net", vec![kp.node_id()]);
    let now = now_millis();

    let mut view = SporeView::new(
        network.clone(),
        kp.clone(),
        MergeConfig::default(),
        now - 10_000,
    )
    .unwrap();

    let member = NodeKeypair::generate();
    let mut nodes = BTreeMap::new();
    let entry = NodeIdentity::new(&member, NodeRole::DedicatedBackbone, vec![], now - 120_000);
    nodes.insert(entry.node_id, entry);
    let seed = SporeRecord::build(
        SporeTier::Seed,
        network,
        nodes,
        BTreeMap::new(),
        BTreeMap::new(),
        now - 120_000,
        &kp,
    )
    .unwrap();
    view.ingest(seed).unwrap();

    let (tier, record) = view.authoritative().unwrap();
    assert_eq!(tier, SporeTier::Seed);
    assert_eq!(record.nodes.len(), 1);
}

/// Two admissions for the same node id contend on one resource key and
/// resolve strictly in proposal order.
#[tokio::test]
async fn same_subject_admissions_resolve_in_order() {
    let (handle, _trust_rx) = Engine::spawn(EngineConfig::default().with_round(RoundConfig::default()));
    let (keypairs, eligible) = backbone_voters(&[0.8, 0.8, 0.8]);

    let first = admission_proposal(keypairs[0].node_id(), [9; 32]);
    let second = admission_proposal(keypairs[1].node_id(), [9; 32]);
    let (first_id, second_id) = (first.id, second.id);

    handle.propose(first, eligible.clone()).await.unwrap();
    handle.propose(second, eligible).await.unwrap();

    // The second cannot accept votes while the first is open
    let early = CommitRecord::sign(
        &keypairs[0],
        second_id,
        b"approve",
        &fresh_nonce(),
        now_millis(),
    )
    .unwrap();
    assert!(matches!(
        handle.commit(early).await,
        Err(ConsensusError::Phase { phase: "queued", .. })
    ));
    assert_eq!(handle.get_result(second_id).await.unwrap(), None);

    run_votes(&handle, &keypairs, first_id, &[b"approve".as_slice(); 3]).await;
    assert_eq!(
        handle.get_result(first_id).await.unwrap(),
        Some(Resolution::Committed(b"approve".to_vec()))
    );

    // Only now does the second round accept votes
    run_votes(&handle, &keypairs, second_id, &[b"deny".as_slice(); 3]).await;
    assert_eq!(
        handle.get_result(second_id).await.unwrap(),
        Some(Resolution::Committed(b"deny".to_vec()))
    );
}

/// A spore record survives serialize → sign → validate with identical
/// membership and trust contents, end to end through a view.
#[test]
fn spore_record_roundtrip_preserves_contents() {
    let kp = NodeKeypair::generate();
    let network = NetworkIdentity::new_genesis("roundtrip-net", vec![kp.node_id()]);
    let now = now_millis();

    let member = NodeKeypair::generate();
    let mut nodes = BTreeMap::new();
    let entry = NodeIdentity::new(&member, NodeRole::SemiNode { promotion_eligible: true }, vec!["10.1.1.1:7000".into()], now);
    nodes.insert(entry.node_id, entry);
    let mut trust = BTreeMap::new();
    trust.insert(member.node_id(), TrustScore::clamped(0.42));

    let record = SporeRecord::build(
        SporeTier::Latent,
        network.clone(),
        nodes.clone(),
        BTreeMap::new(),
        trust.clone(),
        now,
        &kp,
    )
    .unwrap();

    // Wire roundtrip, then validation through a receiving view
    let bytes = serde_json::to_vec(&record).unwrap();
    let decoded: SporeRecord = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(decoded.nodes, nodes);
    assert_eq!(decoded.trust, trust);

    let receiver = NodeKeypair::generate();
    let mut view = SporeView::new(network, receiver, MergeConfig::default(), now).unwrap();
    assert!(view.ingest(decoded).unwrap());
    assert_eq!(view.get_active_nodes().len(), 1);
}

/// Equivocation in a live round is excluded from the tally and floors the
/// equivocator's trust in a single event.
#[tokio::test]
async fn equivocator_is_excluded_and_floored() {
    let (handle, mut trust_rx) = Engine::spawn(EngineConfig::default());
    let (keypairs, eligible) = backbone_voters(&[0.7, 0.7, 0.7]);
    let liar = keypairs[2].node_id();

    let proposal = admission_proposal(keypairs[0].node_id(), [3; 32]);
    let id = proposal.id;
    handle.propose(proposal, eligible).await.unwrap();

    let mut nonces = Vec::new();
    for kp in &keypairs {
        let nonce = fresh_nonce();
        let commit = CommitRecord::sign(kp, id, b"approve", &nonce, now_millis()).unwrap();
        handle.commit(commit).await.unwrap();
        nonces.push(nonce);
    }

    // The liar reveals a different value than it committed
    let lying = RevealRecord::sign(
        &keypairs[2],
        id,
        b"deny".to_vec(),
        fresh_nonce(),
        now_millis(),
    )
    .unwrap();
    assert!(matches!(
        handle.reveal(lying).await,
        Err(ConsensusError::Mismatch { .. })
    ));

    for (kp, nonce) in keypairs[..2].iter().zip(&nonces[..2]) {
        let reveal =
            RevealRecord::sign(kp, id, b"approve".to_vec(), *nonce, now_millis()).unwrap();
        handle.reveal(reveal).await.unwrap();
    }

    // The two honest reveals are unanimous among valid participants
    assert_eq!(
        handle.get_result(id).await.unwrap(),
        Some(Resolution::Committed(b"approve".to_vec()))
    );

    let mut table = TrustTable::new(TrustConfig::default());
    for kp in &keypairs {
        table.admit(kp.node_id());
    }
    while let Ok((node, event)) = trust_rx.try_recv() {
        table.record_event(node, event, now_millis());
    }
    assert!(!table.is_eligible(&liar));
    assert!(table.is_eligible(&keypairs[0].node_id()));
}
