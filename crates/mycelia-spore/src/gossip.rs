//! Latent-tier anti-entropy gossip.
//!
//! Pairwise exchange: a node periodically sends a [`GossipMessage::Digest`]
//! of its Latent record to a peer. If the digests differ the peer replies
//! with its full record; whichever side turns out to hold the older record
//! merges and, if it had the newer one, pushes it back. Two healthy peers
//! therefore converge in at most three messages, and repeated rounds across
//! the mesh converge the whole Latent tier.
//!
//! This is the lowest-authority but highest-availability tier: it keeps
//! working across partial partitions where Primary and Seed cannot.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::merge::supersedes;
use crate::record::{SporeRecord, SporeTier};
use crate::view::SporeView;

/// Wire messages of the anti-entropy exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Compact summary of the sender's Latent record.
    Digest {
        /// Network the record belongs to.
        network_id: [u8; 32],
        /// The record's last_updated.
        last_updated: u64,
        /// Blake3 over the record's signing bytes.
        content_hash: [u8; 32],
    },
    /// Full record, sent when digests differ.
    Record(Box<SporeRecord>),
}

/// Compute the digest message for the view's Latent record.
pub fn digest(view: &SporeView) -> Result<Option<GossipMessage>> {
    let Some(record) = view.record(SporeTier::Latent) else {
        return Ok(None);
    };
    Ok(Some(GossipMessage::Digest {
        network_id: record.network.network_id,
        last_updated: record.last_updated,
        content_hash: *blake3::hash(&record.signing_bytes()?).as_bytes(),
    }))
}

/// Handle one incoming gossip message, producing at most one reply.
///
/// Cross-network digests are ignored rather than answered; isolation
/// rejection of full records happens inside [`SporeView::ingest`] and is
/// logged there.
pub fn handle(view: &mut SporeView, message: GossipMessage) -> Result<Option<GossipMessage>> {
    match message {
        GossipMessage::Digest {
            network_id,
            content_hash,
            ..
        } => {
            if network_id != view.network().network_id {
                trace!("ignoring digest from foreign network");
                return Ok(None);
            }
            let Some(ours) = view.record(SporeTier::Latent) else {
                return Ok(None);
            };
            if *blake3::hash(&ours.signing_bytes()?).as_bytes() == content_hash {
                trace!("gossip digests match, in sync");
                return Ok(None);
            }
            debug!("gossip digests differ, sending record");
            Ok(Some(GossipMessage::Record(Box::new(ours.clone()))))
        }
        GossipMessage::Record(theirs) => {
            let theirs = *theirs;
            let ours_newer = view
                .record(SporeTier::Latent)
                .map(|ours| supersedes(ours, &theirs))
                .unwrap_or(false);

            // A record that fails validation is dropped, not an exchange
            // failure: gossip peers keep talking.
            let replaced = match view.ingest(theirs) {
                Ok(replaced) => replaced,
                Err(err) => {
                    warn!(%err, "gossiped record rejected");
                    return Ok(None);
                }
            };
            if replaced {
                debug!("gossip record merged");
                return Ok(None);
            }
            if ours_newer {
                // They sent us an older record; push ours back so the
                // exchange converges in this round.
                let ours = view
                    .record(SporeTier::Latent)
                    .expect("latent record exists")
                    .clone();
                return Ok(Some(GossipMessage::Record(Box::new(ours))));
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeConfig;
    use crate::record::NodeIdentity;
    use crate::view::RegistrationRequest;
    use mycelia_identity::{now_millis, NetworkIdentity, NodeKeypair, NodeRole};

    fn peer_views() -> (SporeView, SporeView, NetworkIdentity) {
        let kp_a = NodeKeypair::generate();
        let kp_b = NodeKeypair::generate();
        let network =
            NetworkIdentity::new_genesis("gossip-net", vec![kp_a.node_id(), kp_b.node_id()]);
        let a = SporeView::new(network.clone(), kp_a, MergeConfig::default(), 1_000).unwrap();
        let b = SporeView::new(network.clone(), kp_b, MergeConfig::default(), 1_000).unwrap();
        (a, b, network)
    }

    fn register_someone(view: &mut SporeView, network: &NetworkIdentity, now: u64) {
        let kp = NodeKeypair::generate();
        let entry = NodeIdentity::new(&kp, NodeRole::SemiNode { promotion_eligible: false }, vec![], now);
        let proof = kp.membership_proof(network);
        let signature = kp.sign(&proof);
        view.register_node(
            RegistrationRequest {
                network: network.clone(),
                entry,
                proof,
                signature,
            },
            now,
        )
        .unwrap();
    }

    /// Pump messages between two views until neither has anything to say.
    fn run_exchange(a: &mut SporeView, b: &mut SporeView) {
        for _ in 0..8 {
            let Some(d) = digest(a).unwrap() else { return };
            let mut reply = handle(b, d).unwrap();
            let mut to_a = true;
            while let Some(msg) = reply {
                reply = if to_a {
                    handle(a, msg).unwrap()
                } else {
                    handle(b, msg).unwrap()
                };
                to_a = !to_a;
            }
        }
    }

    #[test]
    fn peers_converge_after_exchange() {
        let (mut a, mut b, network) = peer_views();
        register_someone(&mut a, &network, now_millis());

        run_exchange(&mut a, &mut b);
        // Initiate from the other side too, so the freshest record wins
        run_exchange(&mut b, &mut a);

        assert_eq!(a.get_active_nodes().len(), 1);
        assert_eq!(b.get_active_nodes().len(), 1);
        assert_eq!(
            a.record(SporeTier::Latent).unwrap().last_updated,
            b.record(SporeTier::Latent).unwrap().last_updated
        );
    }

    #[test]
    fn in_sync_peers_stay_quiet() {
        let (mut a, mut b, network) = peer_views();
        register_someone(&mut a, &network, now_millis());
        run_exchange(&mut a, &mut b);
        run_exchange(&mut b, &mut a);

        // Converged: a fresh digest draws no reply
        let d = digest(&a).unwrap().unwrap();
        assert!(handle(&mut b, d).unwrap().is_none());
    }

    #[test]
    fn foreign_digest_is_ignored() {
        let (_a, mut b, _network) = peer_views();
        let foreign = GossipMessage::Digest {
            network_id: [9u8; 32],
            last_updated: 99,
            content_hash: [9u8; 32],
        };
        assert!(handle(&mut b, foreign).unwrap().is_none());
    }
}
