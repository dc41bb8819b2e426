//! The per-operation commit-reveal state machine.
//!
//! A [`Round`] is pure state plus transitions: it never waits, never knows
//! about channels or clocks beyond the timestamps it is handed. The async
//! engine drives it; tests drive it directly.
//!
//! Phases: `Committing → Revealing → Resolved`. A round resolves exactly
//! once. Equivocation (a second commit, or a reveal that does not open the
//! commit digest) removes the node from the tally entirely and is recorded
//! as evidence for the trust subsystem.

use std::collections::{BTreeMap, BTreeSet};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mycelia_identity::NodeId;
use mycelia_trust::{TrustEvent, TrustScore};

use crate::error::{Error, Result};
use crate::operation::{CommitRecord, OperationId, Proposal, RevealRecord};
use crate::tally::{supermajority, tally};

/// An eligible voter: trust weight and verification key.
#[derive(Debug, Clone, Copy)]
pub struct Voter {
    pub trust: TrustScore,
    pub key: VerifyingKey,
}

/// Tunables for round pacing and quorum.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    /// How long the commit phase stays open, millis.
    pub commit_timeout_millis: u64,
    /// How long the reveal phase stays open, millis.
    pub reveal_timeout_millis: u64,
    /// Minimum eligible voters to open a round, and minimum commits /
    /// reveals to proceed past a timeout.
    pub min_quorum: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            commit_timeout_millis: 30_000,
            reveal_timeout_millis: 30_000,
            min_quorum: 3,
        }
    }
}

impl RoundConfig {
    #[must_use]
    pub fn with_commit_timeout(mut self, millis: u64) -> Self {
        self.commit_timeout_millis = millis;
        self
    }

    #[must_use]
    pub fn with_reveal_timeout(mut self, millis: u64) -> Self {
        self.reveal_timeout_millis = millis;
        self
    }

    #[must_use]
    pub fn with_min_quorum(mut self, quorum: usize) -> Self {
        self.min_quorum = quorum;
        self
    }
}

/// Terminal outcome of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// A result held a strict supermajority of participating trust weight.
    Committed(Vec<u8>),
    /// Votes were cast but no result reached the supermajority.
    Rejected,
    /// A phase expired below quorum. Retry needs a fresh operation id.
    TimedOut,
}

/// Where the round currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Committing,
    Revealing,
    Resolved(Resolution),
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Committing => "committing",
            Phase::Revealing => "revealing",
            Phase::Resolved(_) => "resolved",
        }
    }
}

/// One in-flight commit-reveal round.
#[derive(Debug)]
pub struct Round {
    proposal: Proposal,
    config: RoundConfig,
    eligible: BTreeMap<NodeId, Voter>,
    commits: BTreeMap<NodeId, CommitRecord>,
    reveals: BTreeMap<NodeId, RevealRecord>,
    equivocators: BTreeSet<NodeId>,
    phase: Phase,
    phase_started_at: u64,
}

impl Round {
    /// Open a round for a proposal over an eligible voter set.
    ///
    /// Fails with a quorum error if too few voters are eligible; the
    /// operation never opens in that case.
    pub fn open(
        proposal: Proposal,
        eligible: BTreeMap<NodeId, Voter>,
        config: RoundConfig,
        now: u64,
    ) -> Result<Self> {
        if eligible.len() < config.min_quorum {
            return Err(Error::Quorum {
                eligible: eligible.len(),
                required: config.min_quorum,
            });
        }
        info!(
            operation = %proposal.id,
            kind = proposal.operation.kind(),
            eligible = eligible.len(),
            "round opened"
        );
        Ok(Self {
            proposal,
            config,
            eligible,
            commits: BTreeMap::new(),
            reveals: BTreeMap::new(),
            equivocators: BTreeSet::new(),
            phase: Phase::Committing,
            phase_started_at: now,
        })
    }

    pub fn id(&self) -> OperationId {
        self.proposal.id
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The resolution, once reached.
    pub fn resolution(&self) -> Option<&Resolution> {
        match &self.phase {
            Phase::Resolved(resolution) => Some(resolution),
            _ => None,
        }
    }

    /// Absolute deadline (unix millis) of the current phase, if any.
    pub fn deadline(&self) -> Option<u64> {
        match self.phase {
            Phase::Committing => {
                Some(self.phase_started_at + self.config.commit_timeout_millis)
            }
            Phase::Revealing => {
                Some(self.phase_started_at + self.config.reveal_timeout_millis)
            }
            Phase::Resolved(_) => None,
        }
    }

    fn voter(&self, node: &NodeId) -> Result<&Voter> {
        self.eligible.get(node).ok_or_else(|| Error::Ineligible {
            node: node.to_hex(),
            operation: self.proposal.id.to_string(),
        })
    }

    /// Record a commit.
    ///
    /// A second commit from the same node is equivocation evidence: the
    /// node is excluded from the tally and the duplicate is rejected.
    pub fn record_commit(&mut self, commit: CommitRecord, now: u64) -> Result<()> {
        if self.phase != Phase::Committing {
            return Err(Error::Phase {
                operation: self.proposal.id.to_string(),
                phase: self.phase.name(),
                what: "commit",
            });
        }
        let voter = *self.voter(&commit.node)?;
        commit.verify(&voter.key)?;

        if self.commits.contains_key(&commit.node) {
            warn!(operation = %self.proposal.id, node = %commit.node, "duplicate commit, marking equivocator");
            self.equivocators.insert(commit.node);
            return Err(Error::Duplicate {
                what: "commit",
                node: commit.node.to_hex(),
                operation: self.proposal.id.to_string(),
            });
        }

        let node = commit.node;
        self.commits.insert(node, commit);
        debug!(operation = %self.proposal.id, node = %node, commits = self.commits.len(), "commit recorded");

        if self.commits.len() == self.eligible.len() {
            self.enter_reveal(now);
        }
        Ok(())
    }

    /// Record a reveal.
    ///
    /// A reveal that does not open the node's commit digest is equivocation:
    /// the vote is discarded from both sides of the tally and the mismatch
    /// is surfaced to the caller.
    pub fn record_reveal(&mut self, reveal: RevealRecord, now: u64) -> Result<()> {
        if self.phase != Phase::Revealing {
            return Err(Error::Phase {
                operation: self.proposal.id.to_string(),
                phase: self.phase.name(),
                what: "reveal",
            });
        }
        let voter = *self.voter(&reveal.node)?;
        reveal.verify(&voter.key)?;

        let Some(commit) = self.commits.get(&reveal.node) else {
            return Err(Error::Ineligible {
                node: reveal.node.to_hex(),
                operation: self.proposal.id.to_string(),
            });
        };

        if self.reveals.contains_key(&reveal.node) {
            warn!(operation = %self.proposal.id, node = %reveal.node, "duplicate reveal, marking equivocator");
            self.equivocators.insert(reveal.node);
            return Err(Error::Duplicate {
                what: "reveal",
                node: reveal.node.to_hex(),
                operation: self.proposal.id.to_string(),
            });
        }

        if !reveal.opens(&commit.digest) {
            warn!(operation = %self.proposal.id, node = %reveal.node, "reveal does not open commit digest, marking equivocator");
            self.equivocators.insert(reveal.node);
            return Err(Error::Mismatch {
                node: reveal.node.to_hex(),
            });
        }

        let node = reveal.node;
        self.reveals.insert(node, reveal);
        debug!(operation = %self.proposal.id, node = %node, reveals = self.reveals.len(), "reveal recorded");

        // Every non-equivocating committer has revealed
        let expected = self
            .commits
            .keys()
            .filter(|n| !self.equivocators.contains(n))
            .count();
        let valid = self
            .reveals
            .keys()
            .filter(|n| !self.equivocators.contains(n))
            .count();
        if valid == expected {
            self.resolve(now);
        }
        Ok(())
    }

    /// Advance past an expired phase deadline.
    ///
    /// No-op if the deadline has not passed. Commit expiry proceeds to the
    /// reveal phase when at least a quorum committed, otherwise times out;
    /// reveal expiry tallies what was revealed when at least a quorum did,
    /// otherwise times out.
    pub fn tick(&mut self, now: u64) {
        let Some(deadline) = self.deadline() else {
            return;
        };
        if now < deadline {
            return;
        }
        match self.phase {
            Phase::Committing => {
                let valid = self
                    .commits
                    .keys()
                    .filter(|n| !self.equivocators.contains(n))
                    .count();
                if valid >= self.config.min_quorum {
                    debug!(operation = %self.proposal.id, commits = valid, "commit phase expired at quorum");
                    self.enter_reveal(now);
                } else {
                    info!(operation = %self.proposal.id, commits = valid, "commit phase expired below quorum");
                    self.phase = Phase::Resolved(Resolution::TimedOut);
                }
            }
            Phase::Revealing => {
                let valid = self
                    .reveals
                    .keys()
                    .filter(|n| !self.equivocators.contains(n))
                    .count();
                if valid >= self.config.min_quorum {
                    debug!(operation = %self.proposal.id, reveals = valid, "reveal phase expired at quorum");
                    self.resolve(now);
                } else {
                    info!(operation = %self.proposal.id, reveals = valid, "reveal phase expired below quorum");
                    self.phase = Phase::Resolved(Resolution::TimedOut);
                }
            }
            Phase::Resolved(_) => {}
        }
    }

    fn enter_reveal(&mut self, now: u64) {
        debug!(operation = %self.proposal.id, "entering reveal phase");
        self.phase = Phase::Revealing;
        self.phase_started_at = now;
    }

    fn resolve(&mut self, _now: u64) {
        let mut votes = BTreeMap::new();
        let mut weights = BTreeMap::new();
        for (node, reveal) in &self.reveals {
            if self.equivocators.contains(node) {
                continue;
            }
            votes.insert(*node, reveal.value.clone());
            weights.insert(*node, self.eligible[node].trust);
        }

        let resolution = match tally(&votes, &weights) {
            Some(outcome) if supermajority(outcome.winner_weight, outcome.participating_weight) => {
                Resolution::Committed(outcome.winner)
            }
            Some(_) => Resolution::Rejected,
            None => Resolution::TimedOut,
        };
        info!(operation = %self.proposal.id, resolution = ?discriminant_name(&resolution), "round resolved");
        self.phase = Phase::Resolved(resolution);
    }

    /// Trust evidence produced by this round, available once resolved.
    ///
    /// Equivocators are penalized severely regardless of outcome; eligible
    /// voters that never revealed a valid vote get the mild non-participation
    /// penalty; winners and valid losers are classed only when a result
    /// actually committed.
    pub fn trust_events(&self) -> Vec<(NodeId, TrustEvent)> {
        let Phase::Resolved(resolution) = &self.phase else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for node in &self.equivocators {
            events.push((*node, TrustEvent::Equivocation));
        }

        let valid_reveals: BTreeMap<NodeId, &RevealRecord> = self
            .reveals
            .iter()
            .filter(|(node, _)| !self.equivocators.contains(*node))
            .map(|(node, reveal)| (*node, reveal))
            .collect();

        for node in self.eligible.keys() {
            if !self.equivocators.contains(node) && !valid_reveals.contains_key(node) {
                events.push((*node, TrustEvent::NonParticipation));
            }
        }

        if let Resolution::Committed(winner) = resolution {
            for (node, reveal) in &valid_reveals {
                if &reveal.value == winner {
                    events.push((*node, TrustEvent::CorrectReveal));
                } else {
                    events.push((*node, TrustEvent::LosingReveal));
                }
            }
        }

        events
    }
}

fn discriminant_name(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Committed(_) => "committed",
        Resolution::Rejected => "rejected",
        Resolution::TimedOut => "timed-out",
    }
}
