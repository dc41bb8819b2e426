//! The async round driver.
//!
//! One engine task owns all in-flight rounds, the resource-key scheduler,
//! and the service-decision precedence table. Callers talk to it through an
//! [`EngineHandle`] over an mpsc channel; every request carries a oneshot
//! for its reply. Trust evidence produced by resolved rounds flows out on a
//! separate channel for the trust subsystem to apply.
//!
//! Phase deadlines are wall-clock millis carried by each round; the task
//! sleeps until the earliest one and ticks the owning round when it fires.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use mycelia_identity::{now_millis, NodeId};
use mycelia_spore::SporeTier;
use mycelia_trust::TrustEvent;

use crate::error::{Error, Result};
use crate::operation::{CommitRecord, ConsensusOperation, OperationId, Proposal, RevealRecord};
use crate::round::{Resolution, Round, RoundConfig, Voter};
use crate::scheduler::ResourceScheduler;

/// Engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub round: RoundConfig,
    /// Resolved results retained for queries before the oldest are dropped.
    pub max_resolved: usize,
    /// Service precedence entries retained before the oldest are dropped.
    pub max_service_decisions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round: RoundConfig::default(),
            max_resolved: 1024,
            max_service_decisions: 1024,
        }
    }
}

impl EngineConfig {
    /// Set the round tunables.
    #[must_use]
    pub fn with_round(mut self, round: RoundConfig) -> Self {
        self.round = round;
        self
    }

    /// Set how many resolved results are retained.
    #[must_use]
    pub fn with_max_resolved(mut self, max: usize) -> Self {
        self.max_resolved = max;
        self
    }
}

enum Command {
    Propose {
        proposal: Proposal,
        eligible: BTreeMap<NodeId, Voter>,
        reply: oneshot::Sender<Result<()>>,
    },
    Commit {
        commit: CommitRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    Reveal {
        reveal: RevealRecord,
        reply: oneshot::Sender<Result<()>>,
    },
    GetResult {
        operation: OperationId,
        reply: oneshot::Sender<Option<Resolution>>,
    },
}

/// Caller-side handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Propose an operation over an eligible voter set.
    ///
    /// Commit-reveal operations open a round (or queue behind the same
    /// resource key); service deployment decisions resolve immediately by
    /// authority precedence.
    pub async fn propose(
        &self,
        proposal: Proposal,
        eligible: BTreeMap<NodeId, Voter>,
    ) -> Result<()> {
        self.request(|reply| Command::Propose {
            proposal,
            eligible,
            reply,
        })
        .await?
    }

    /// Submit a commit for an open round.
    pub async fn commit(&self, commit: CommitRecord) -> Result<()> {
        self.request(|reply| Command::Commit { commit, reply }).await?
    }

    /// Submit a reveal for a round in its reveal phase.
    pub async fn reveal(&self, reveal: RevealRecord) -> Result<()> {
        self.request(|reply| Command::Reveal { reveal, reply }).await?
    }

    /// The resolution of an operation, if it has resolved.
    pub async fn get_result(&self, operation: OperationId) -> Result<Option<Resolution>> {
        self.request(|reply| Command::GetResult { operation, reply })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::EngineClosed)?;
        reply_rx.await.map_err(|_| Error::EngineClosed)
    }
}

enum Slot {
    /// Queued behind another operation on the same resource key.
    Waiting {
        proposal: Proposal,
        eligible: BTreeMap<NodeId, Voter>,
    },
    /// Open and accepting commits/reveals.
    Running(Round),
    /// Resolved; kept for result queries.
    Done(Resolution),
}

/// The consensus engine. Construct with [`Engine::spawn`].
pub struct Engine {
    config: EngineConfig,
    rounds: BTreeMap<OperationId, Slot>,
    keys: BTreeMap<OperationId, [u8; 32]>,
    scheduler: ResourceScheduler,
    /// Highest-authority issuer seen per service, for precedence.
    decisions: BTreeMap<String, SporeTier>,
    /// Resolved operations in resolution order, for retention.
    resolved_order: VecDeque<OperationId>,
    /// Services in first-decision order, for retention.
    decision_order: VecDeque<String>,
    trust_tx: mpsc::UnboundedSender<(NodeId, TrustEvent)>,
}

impl Engine {
    /// Spawn the engine task.
    ///
    /// Returns the caller handle and the stream of trust evidence emitted
    /// by resolved rounds. Dropping all handles shuts the task down.
    pub fn spawn(
        config: EngineConfig,
    ) -> (EngineHandle, mpsc::UnboundedReceiver<(NodeId, TrustEvent)>) {
        let (tx, rx) = mpsc::channel(64);
        let (trust_tx, trust_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            config,
            rounds: BTreeMap::new(),
            keys: BTreeMap::new(),
            scheduler: ResourceScheduler::new(),
            decisions: BTreeMap::new(),
            resolved_order: VecDeque::new(),
            decision_order: VecDeque::new(),
            trust_tx,
        };
        tokio::spawn(engine.run(rx));
        (EngineHandle { tx }, trust_rx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => self.handle(command),
                        None => break,
                    }
                }
                _ = Self::sleep_to(next_deadline), if next_deadline.is_some() => {
                    self.tick(now_millis());
                }
            }
        }
        debug!("consensus engine stopped");
    }

    async fn sleep_to(deadline: Option<u64>) {
        let Some(deadline) = deadline else {
            return;
        };
        let now = now_millis();
        let wait = deadline.saturating_sub(now);
        sleep_until(Instant::now() + Duration::from_millis(wait)).await;
    }

    fn next_deadline(&self) -> Option<u64> {
        self.rounds
            .values()
            .filter_map(|slot| match slot {
                Slot::Running(round) => round.deadline(),
                _ => None,
            })
            .min()
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Propose {
                proposal,
                eligible,
                reply,
            } => {
                let _ = reply.send(self.propose(proposal, eligible));
            }
            Command::Commit { commit, reply } => {
                let operation = commit.operation;
                let result = self.with_running(operation, |round, now| round.record_commit(commit, now));
                self.after_mutation(operation);
                let _ = reply.send(result);
            }
            Command::Reveal { reveal, reply } => {
                let operation = reveal.operation;
                let result = self.with_running(operation, |round, now| round.record_reveal(reveal, now));
                self.after_mutation(operation);
                let _ = reply.send(result);
            }
            Command::GetResult { operation, reply } => {
                let resolution = match self.rounds.get(&operation) {
                    Some(Slot::Done(resolution)) => Some(resolution.clone()),
                    Some(Slot::Running(round)) => round.resolution().cloned(),
                    _ => None,
                };
                let _ = reply.send(resolution);
            }
        }
    }

    fn propose(&mut self, proposal: Proposal, eligible: BTreeMap<NodeId, Voter>) -> Result<()> {
        if self.rounds.contains_key(&proposal.id) {
            return Err(Error::Duplicate {
                what: "proposal",
                node: proposal.proposer.to_hex(),
                operation: proposal.id.to_string(),
            });
        }

        if !proposal.operation.requires_commit_reveal() {
            let resolution = self.resolve_by_authority(&proposal, &eligible);
            self.finish(proposal.id, resolution);
            return Ok(());
        }

        if eligible.len() < self.config.round.min_quorum {
            return Err(Error::Quorum {
                eligible: eligible.len(),
                required: self.config.round.min_quorum,
            });
        }

        let key = proposal.operation.resource_key();
        let id = proposal.id;
        self.keys.insert(id, key);

        if self.scheduler.enqueue(key, id) {
            let round = Round::open(proposal, eligible, self.config.round, now_millis())?;
            self.rounds.insert(id, Slot::Running(round));
        } else {
            debug!(operation = %id, "operation queued behind resource key");
            self.rounds.insert(id, Slot::Waiting { proposal, eligible });
        }
        Ok(())
    }

    /// Resolve a service deployment decision by issuer authority.
    ///
    /// The proposer must stand in the eligible set with enough trust, and no
    /// earlier decision from a strictly higher tier may exist for the
    /// service.
    fn resolve_by_authority(
        &mut self,
        proposal: &Proposal,
        eligible: &BTreeMap<NodeId, Voter>,
    ) -> Resolution {
        let ConsensusOperation::ServiceDeploymentDecision {
            service,
            issuer_tier,
            deploy,
        } = &proposal.operation
        else {
            return Resolution::Rejected;
        };

        let standing = eligible
            .get(&proposal.proposer)
            .map(|voter| voter.trust.meets(proposal.operation.required_trust()))
            .unwrap_or(false);
        if !standing {
            warn!(operation = %proposal.id, service, "service decision from issuer without standing");
            return Resolution::Rejected;
        }

        if let Some(existing) = self.decisions.get(service) {
            if existing.authority() > issuer_tier.authority() {
                info!(operation = %proposal.id, service, "service decision outranked by earlier issuer");
                return Resolution::Rejected;
            }
        }
        if self.decisions.insert(service.clone(), *issuer_tier).is_none() {
            self.decision_order.push_back(service.clone());
            while self.decision_order.len() > self.config.max_service_decisions {
                if let Some(oldest) = self.decision_order.pop_front() {
                    self.decisions.remove(&oldest);
                }
            }
        }
        info!(operation = %proposal.id, service, deploy, tier = %issuer_tier, "service decision resolved by authority");
        Resolution::Committed(if *deploy {
            b"deploy".to_vec()
        } else {
            b"retire".to_vec()
        })
    }

    fn with_running(
        &mut self,
        operation: OperationId,
        f: impl FnOnce(&mut Round, u64) -> Result<()>,
    ) -> Result<()> {
        match self.rounds.get_mut(&operation) {
            Some(Slot::Running(round)) => f(round, now_millis()),
            Some(Slot::Waiting { .. }) => Err(Error::Phase {
                operation: operation.to_string(),
                phase: "queued",
                what: "submission",
            }),
            Some(Slot::Done(_)) => Err(Error::Phase {
                operation: operation.to_string(),
                phase: "resolved",
                what: "submission",
            }),
            None => Err(Error::UnknownOperation {
                operation: operation.to_string(),
            }),
        }
    }

    fn tick(&mut self, now: u64) {
        let due: Vec<OperationId> = self
            .rounds
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Running(round) => round.deadline().filter(|d| now >= *d).map(|_| *id),
                _ => None,
            })
            .collect();
        for id in due {
            if let Some(Slot::Running(round)) = self.rounds.get_mut(&id) {
                round.tick(now);
            }
            self.after_mutation(id);
        }
    }

    /// Store a resolution, dropping the oldest one past the retention cap.
    fn finish(&mut self, operation: OperationId, resolution: Resolution) {
        self.rounds.insert(operation, Slot::Done(resolution));
        self.resolved_order.push_back(operation);
        while self.resolved_order.len() > self.config.max_resolved {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.rounds.remove(&oldest);
            }
        }
    }

    /// Finalize a round if it just resolved: emit trust evidence, free its
    /// resource key, and open the next round waiting on that key.
    fn after_mutation(&mut self, operation: OperationId) {
        let resolved = match self.rounds.get(&operation) {
            Some(Slot::Running(round)) => round.resolution().is_some(),
            _ => false,
        };
        if !resolved {
            return;
        }

        let Some(Slot::Running(round)) = self.rounds.remove(&operation) else {
            return;
        };
        for event in round.trust_events() {
            let _ = self.trust_tx.send(event);
        }
        let resolution = round
            .resolution()
            .cloned()
            .unwrap_or(Resolution::TimedOut);
        self.finish(operation, resolution);

        let Some(key) = self.keys.remove(&operation) else {
            return;
        };
        let mut next = self.scheduler.complete(&key, &operation);
        while let Some(next_id) = next.take() {
            let Some(Slot::Waiting { proposal, eligible }) = self.rounds.remove(&next_id) else {
                break;
            };
            match Round::open(proposal, eligible, self.config.round, now_millis()) {
                Ok(round) => {
                    debug!(operation = %next_id, "queued operation unblocked");
                    self.rounds.insert(next_id, Slot::Running(round));
                }
                Err(err) => {
                    // Quorum can only have shrunk since proposal; treat as
                    // a timed-out attempt.
                    warn!(operation = %next_id, %err, "queued operation failed to open");
                    self.keys.remove(&next_id);
                    self.finish(next_id, Resolution::TimedOut);
                    next = self.scheduler.complete(&key, &next_id);
                }
            }
        }
    }
}
