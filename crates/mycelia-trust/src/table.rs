//! The trust table: the single mutation path for trust scores.
//!
//! Every score change funnels through [`TrustTable::record_event`] or
//! [`TrustTable::apply_idle_decay`]. No other component writes scores
//! directly; the consensus engine emits [`TrustEvent`]s and the discovery
//! layer reads the resulting values back into spore records.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mycelia_identity::NodeId;

use crate::error::Result;
use crate::score::TrustScore;

/// Outcome classes fed back from consensus resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEvent {
    /// Valid reveal that contributed to the winning result.
    CorrectReveal,
    /// Valid reveal for a result that lost the weighted tally.
    LosingReveal,
    /// Committed but never revealed, or never committed at all.
    NonParticipation,
    /// Mismatched reveal or duplicate commit. Byzantine evidence.
    Equivocation,
}

/// Tunable parameters of the trust subsystem.
///
/// All magnitudes are configuration, pending empirical tuning. The single
/// positive delta (`reward_correct`) is deliberately small: recovering from
/// below the floor always takes sustained participation, a single good act
/// cannot erase a Byzantine history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Score assigned on first admission.
    pub initial_score: f64,
    /// Below this, a node is ineligible for commit-reveal rounds.
    pub eligibility_floor: f64,
    /// Delta for a correct reveal.
    pub reward_correct: f64,
    /// Delta for a valid reveal on the losing side.
    pub penalty_losing: f64,
    /// Delta for non-participation in a round.
    pub penalty_non_participation: f64,
    /// Delta for equivocation.
    pub penalty_equivocation: f64,
    /// Decay applied per hour of idleness beyond the grace period.
    pub idle_decay_per_hour: f64,
    /// Idle time (millis) before decay starts.
    pub idle_grace_millis: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            initial_score: 0.35,
            eligibility_floor: 0.2,
            reward_correct: 0.02,
            penalty_losing: 0.05,
            penalty_non_participation: 0.02,
            penalty_equivocation: 0.35,
            idle_decay_per_hour: 0.01,
            idle_grace_millis: 60 * 60 * 1000,
        }
    }
}

impl TrustConfig {
    /// Set the eligibility floor.
    #[must_use]
    pub fn with_floor(mut self, floor: f64) -> Self {
        self.eligibility_floor = floor;
        self
    }

    /// Set the initial score for newly admitted nodes.
    #[must_use]
    pub fn with_initial_score(mut self, score: f64) -> Self {
        self.initial_score = score;
        self
    }

    /// Set the idle decay rate (per hour beyond grace).
    #[must_use]
    pub fn with_idle_decay(mut self, per_hour: f64, grace_millis: u64) -> Self {
        self.idle_decay_per_hour = per_hour;
        self.idle_grace_millis = grace_millis;
        self
    }

    /// The signed delta for an event class.
    pub fn delta_for(&self, event: TrustEvent) -> f64 {
        match event {
            TrustEvent::CorrectReveal => self.reward_correct,
            TrustEvent::LosingReveal => -self.penalty_losing,
            TrustEvent::NonParticipation => -self.penalty_non_participation,
            TrustEvent::Equivocation => -self.penalty_equivocation,
        }
    }
}

/// Per-node participation counters kept alongside the score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ParticipationMetrics {
    /// Rounds in which this node was eligible.
    pub rounds: u64,
    /// Correct reveals contributing to winning results.
    pub correct_reveals: u64,
    /// Recorded equivocations.
    pub equivocations: u64,
    /// Unix-millis of the last consensus event for this node.
    pub last_event: u64,
    /// Unix-millis up to which idle decay has already been charged.
    #[serde(default)]
    pub decayed_until: u64,
}

/// Process-scoped trust state, keyed by node id.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrustTable {
    config: TrustConfig,
    scores: BTreeMap<NodeId, TrustScore>,
    metrics: BTreeMap<NodeId, ParticipationMetrics>,
}

impl TrustTable {
    /// Create an empty table with the given config.
    pub fn new(config: TrustConfig) -> Self {
        Self {
            config,
            scores: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Admit a node at the configured initial score. No-op if known.
    pub fn admit(&mut self, node: NodeId) -> TrustScore {
        *self
            .scores
            .entry(node)
            .or_insert_with(|| TrustScore::clamped(self.config.initial_score))
    }

    /// Current score for a node, if known.
    pub fn score(&self, node: &NodeId) -> Option<TrustScore> {
        self.scores.get(node).copied()
    }

    /// Whether a node may participate in commit-reveal rounds.
    pub fn is_eligible(&self, node: &NodeId) -> bool {
        self.score(node)
            .map(|s| s.meets(self.config.eligibility_floor))
            .unwrap_or(false)
    }

    /// Record a consensus participation outcome and return the new score.
    ///
    /// This is the single update entry point for consensus-driven changes.
    pub fn record_event(&mut self, node: NodeId, event: TrustEvent, now: u64) -> TrustScore {
        let old = self.admit(node);
        let new = old.apply(self.config.delta_for(event));
        self.scores.insert(node, new);

        let metrics = self.metrics.entry(node).or_default();
        metrics.rounds += 1;
        metrics.last_event = now;
        match event {
            TrustEvent::CorrectReveal => metrics.correct_reveals += 1,
            TrustEvent::Equivocation => {
                metrics.equivocations += 1;
                warn!(node = %node, old = %old, new = %new, "equivocation penalty applied");
            }
            _ => {}
        }

        debug!(node = %node, ?event, old = %old, new = %new, "trust updated");
        new
    }

    /// Apply idle decay proportional to time since `last_seen`.
    ///
    /// Independent of consensus events; called from the discovery layer's
    /// periodic sweep. Each node remembers how far decay has already been
    /// charged, so total decay is linear in idle time no matter how often
    /// the sweep runs.
    pub fn apply_idle_decay(&mut self, node: NodeId, last_seen: u64, now: u64) -> TrustScore {
        let old = self.admit(node);
        let grace_end = last_seen.saturating_add(self.config.idle_grace_millis);
        let charged_until = self.metrics.entry(node).or_default().decayed_until;
        let from = grace_end.max(charged_until);
        if now <= from {
            return old;
        }
        let hours = (now - from) as f64 / 3_600_000.0;
        let new = old.apply(-self.config.idle_decay_per_hour * hours);
        self.scores.insert(node, new);
        if let Some(metrics) = self.metrics.get_mut(&node) {
            metrics.decayed_until = now;
        }
        debug!(node = %node, decayed_millis = now - from, old = %old, new = %new, "idle decay applied");
        new
    }

    /// Participation metrics for a node.
    pub fn metrics(&self, node: &NodeId) -> Option<&ParticipationMetrics> {
        self.metrics.get(node)
    }

    /// Snapshot of all current scores.
    pub fn scores(&self) -> &BTreeMap<NodeId, TrustScore> {
        &self.scores
    }

    /// Remove a node entirely (after a resolved exclusion).
    pub fn remove(&mut self, node: &NodeId) {
        self.scores.remove(node);
        self.metrics.remove(node);
    }

    /// Persist the table as JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a previously persisted table.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}
