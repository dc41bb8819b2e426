//! Trust-weighted vote tallying.
//!
//! A result commits only when it holds *strictly* more than 2/3 of the
//! participating trust weight. Participating weight counts validly revealed,
//! non-equivocating votes only: an excluded vote weakens neither side, it
//! simply does not exist.

use std::collections::BTreeMap;

use mycelia_identity::NodeId;
use mycelia_trust::TrustScore;

/// Outcome of weighing a set of valid reveals.
#[derive(Debug, Clone, PartialEq)]
pub struct TallyOutcome {
    /// The value holding the most weight.
    pub winner: Vec<u8>,
    /// Trust weight behind the winner.
    pub winner_weight: f64,
    /// Total trust weight of all valid reveals.
    pub participating_weight: f64,
    /// Nodes that revealed the winning value.
    pub winners: Vec<NodeId>,
    /// Nodes that validly revealed a different value.
    pub losers: Vec<NodeId>,
}

impl TallyOutcome {
    /// Whether the winner clears the strict two-thirds supermajority.
    pub fn is_supermajority(&self) -> bool {
        supermajority(self.winner_weight, self.participating_weight)
    }
}

/// Strictly more than 2/3 of `total`. Avoids the division: w/t > 2/3 iff
/// 3w > 2t, which also keeps exact-boundary weights on the rejecting side.
pub fn supermajority(weight: f64, total: f64) -> bool {
    total > 0.0 && 3.0 * weight > 2.0 * total
}

/// Weigh valid reveals by voter trust.
///
/// Returns `None` when no valid reveal exists. Ties between equally weighted
/// values break on value byte order so every node computes the same winner
/// (a tied winner can never be a supermajority anyway).
pub fn tally(votes: &BTreeMap<NodeId, Vec<u8>>, weights: &BTreeMap<NodeId, TrustScore>) -> Option<TallyOutcome> {
    if votes.is_empty() {
        return None;
    }

    let mut by_value: BTreeMap<&[u8], (f64, Vec<NodeId>)> = BTreeMap::new();
    let mut participating_weight = 0.0;
    for (node, value) in votes {
        let weight = weights.get(node).map(|t| t.value()).unwrap_or(0.0);
        participating_weight += weight;
        let slot = by_value.entry(value.as_slice()).or_insert((0.0, Vec::new()));
        slot.0 += weight;
        slot.1.push(*node);
    }

    // BTreeMap iteration is value-ordered; > keeps the first (lowest) value
    // on exact weight ties.
    let (winner, (winner_weight, winners)) = by_value
        .iter()
        .max_by(|a, b| {
            a.1 .0
                .partial_cmp(&b.1 .0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.cmp(a.0))
        })
        .map(|(v, w)| (v.to_vec(), w.clone()))?;

    let losers = votes
        .iter()
        .filter(|(_, value)| **value != winner)
        .map(|(node, _)| *node)
        .collect();

    Some(TallyOutcome {
        winner,
        winner_weight,
        participating_weight,
        winners,
        losers,
    })
}
