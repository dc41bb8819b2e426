//! Node runtime configuration.

use std::path::PathBuf;

use mycelia_consensus::{EngineConfig, RoundConfig};
use mycelia_spore::MergeConfig;
use mycelia_trust::TrustConfig;

/// Configuration of one node process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory holding the keypair, network identity, primary log,
    /// seed snapshots, and trust table.
    pub data_dir: PathBuf,

    /// Network to create (as genesis) or join.
    pub network_name: String,

    /// Addresses this node announces in its membership entry.
    pub addresses: Vec<String>,

    /// Tier merge tunables.
    pub merge: MergeConfig,

    /// Trust scoring tunables.
    pub trust: TrustConfig,

    /// Consensus round tunables.
    pub engine: EngineConfig,

    /// How often a seed snapshot is written, millis.
    pub snapshot_interval_millis: u64,

    /// How often the idle-decay sweep runs, millis.
    pub decay_sweep_interval_millis: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(
            std::env::var("MYCELIA_DATA_DIR").unwrap_or_else(|_| "./mycelia-data".to_string()),
        );

        let network_name =
            std::env::var("MYCELIA_NETWORK_NAME").unwrap_or_else(|_| "mycelia".to_string());

        let addresses = std::env::var("MYCELIA_ADDRESSES")
            .map(|s| {
                s.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let merge = MergeConfig::default()
            .with_staleness_bound(env_u64("MYCELIA_STALENESS_BOUND_MS", 300_000));

        let round = RoundConfig::default()
            .with_commit_timeout(env_u64("MYCELIA_COMMIT_TIMEOUT_MS", 30_000))
            .with_reveal_timeout(env_u64("MYCELIA_REVEAL_TIMEOUT_MS", 30_000))
            .with_min_quorum(env_u64("MYCELIA_MIN_QUORUM", 3) as usize);

        Self {
            data_dir,
            network_name,
            addresses,
            merge,
            trust: TrustConfig::default(),
            engine: EngineConfig::default().with_round(round),
            snapshot_interval_millis: env_u64("MYCELIA_SNAPSHOT_INTERVAL_MS", 60_000),
            decay_sweep_interval_millis: env_u64("MYCELIA_DECAY_SWEEP_INTERVAL_MS", 600_000),
        }
    }

    /// Path of the persisted node keypair.
    pub fn keypair_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }

    /// Path of the persisted network identity.
    pub fn network_path(&self) -> PathBuf {
        self.data_dir.join("network.json")
    }

    /// Path of the primary log.
    pub fn primary_log_path(&self) -> PathBuf {
        self.data_dir.join("primary.log")
    }

    /// Directory of seed snapshots.
    pub fn seed_dir(&self) -> PathBuf {
        self.data_dir.join("seeds")
    }

    /// Path of the persisted trust table.
    pub fn trust_path(&self) -> PathBuf {
        self.data_dir.join("trust.json")
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
