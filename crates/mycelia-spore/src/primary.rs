//! Primary-tier replicated log.
//!
//! Backbone nodes maintain an append-only command log; the Primary spore
//! record is the log's materialized state. Entries arrive already agreed
//! (the consensus engine decides what gets appended), so the log itself
//! only enforces ordering and durability. Persistence is JSON lines, one
//! entry per line, appended and fsync-free; a torn tail line is dropped on
//! load.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mycelia_identity::{NetworkIdentity, NodeId, NodeKeypair};
use mycelia_trust::TrustScore;

use crate::error::{Error, Result};
use crate::record::{NodeIdentity, ServiceEndpoint, SporeRecord, SporeTier};

/// A state-changing command applied to the Primary record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogCommand {
    /// Insert or replace a node's membership entry.
    UpsertNode(NodeIdentity),
    /// Remove a node from membership entirely.
    RemoveNode(NodeId),
    /// Set a node's trust score.
    SetTrust { node: NodeId, score: TrustScore },
    /// Register or replace a service endpoint set.
    RegisterService(ServiceEndpoint),
}

/// One entry of the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 0, gapless.
    pub index: u64,
    /// When the entry was appended, unix millis.
    pub timestamp: u64,
    /// The node that proposed the command.
    pub proposer: NodeId,
    /// The command itself.
    pub command: LogCommand,
}

/// The append-only Primary log and its materialized state.
pub struct PrimaryLog {
    network: NetworkIdentity,
    keypair: NodeKeypair,
    path: PathBuf,
    entries: Vec<LogEntry>,
    nodes: BTreeMap<NodeId, NodeIdentity>,
    services: BTreeMap<String, ServiceEndpoint>,
    trust: BTreeMap<NodeId, TrustScore>,
}

impl PrimaryLog {
    /// Open a log file, replaying any existing entries.
    pub fn open(
        network: NetworkIdentity,
        keypair: NodeKeypair,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let mut log = Self {
            network,
            keypair,
            path,
            entries: Vec::new(),
            nodes: BTreeMap::new(),
            services: BTreeMap::new(),
            trust: BTreeMap::new(),
        };
        log.replay()?;
        Ok(log)
    }

    fn replay(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => {
                    if entry.index != self.entries.len() as u64 {
                        warn!(
                            index = entry.index,
                            expected = self.entries.len() as u64,
                            "log entry out of order during replay, truncating"
                        );
                        break;
                    }
                    self.apply(&entry.command);
                    self.entries.push(entry);
                }
                Err(err) => {
                    // A torn tail line from an interrupted write
                    warn!(%err, "dropping unreadable log tail");
                    break;
                }
            }
        }
        info!(entries = self.entries.len(), path = %self.path.display(), "primary log replayed");
        Ok(())
    }

    /// Next index the log will accept.
    pub fn next_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Entries from `from` onward, for catching up a lagging replica.
    pub fn entries_from(&self, from: u64) -> &[LogEntry] {
        let start = (from as usize).min(self.entries.len());
        &self.entries[start..]
    }

    /// Append a locally proposed command at the next index.
    pub fn append(&mut self, proposer: NodeId, command: LogCommand, now: u64) -> Result<u64> {
        let entry = LogEntry {
            index: self.next_index(),
            timestamp: now,
            proposer,
            command,
        };
        let index = entry.index;
        self.append_entry(entry)?;
        Ok(index)
    }

    /// Append an entry received from a peer replica.
    ///
    /// The entry must land exactly at the next index; anything else is a
    /// replication bug upstream and is rejected rather than reordered.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.next_index();
        if entry.index != expected {
            return Err(Error::LogOrder {
                expected,
                actual: entry.index,
            });
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        file.write_all(&line)?;

        debug!(index = entry.index, "primary log entry appended");
        self.apply(&entry.command);
        self.entries.push(entry);
        Ok(())
    }

    fn apply(&mut self, command: &LogCommand) {
        match command {
            LogCommand::UpsertNode(entry) => {
                self.nodes.insert(entry.node_id, entry.clone());
            }
            LogCommand::RemoveNode(node) => {
                self.nodes.remove(node);
                self.trust.remove(node);
            }
            LogCommand::SetTrust { node, score } => {
                self.trust.insert(*node, *score);
                if let Some(entry) = self.nodes.get_mut(node) {
                    entry.trust = *score;
                }
            }
            LogCommand::RegisterService(service) => {
                self.services.insert(service.name.clone(), service.clone());
            }
        }
    }

    /// Materialize the log's state as a signed Primary record.
    pub fn materialize(&self, now: u64) -> Result<SporeRecord> {
        SporeRecord::build(
            SporeTier::Primary,
            self.network.clone(),
            self.nodes.clone(),
            self.services.clone(),
            self.trust.clone(),
            now,
            &self.keypair,
        )
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for PrimaryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimaryLog")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}
