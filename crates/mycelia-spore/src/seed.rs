//! Seed-tier snapshot storage.
//!
//! Seeds are versioned, timestamped snapshots of a [`SporeRecord`] written
//! to durable storage. They are the bootstrap and disaster-recovery anchor:
//! a node that lost its Primary log and has no gossip peers yet can still
//! load the latest seed and rejoin with a recent view. Writes never touch
//! earlier versions, so a corrupted write loses at most one snapshot.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::error::Result;
use crate::record::SporeRecord;

/// Versioned snapshot store for Seed-tier records.
#[derive(Debug)]
pub struct SeedStore {
    dir: PathBuf,
}

impl SeedStore {
    /// Open (creating if needed) a seed store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("seed-{version:08}.json"))
    }

    /// Snapshot versions present on disk, ascending.
    pub fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(v) = name
                .strip_prefix("seed-")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Write a new snapshot, one version past the latest on disk.
    ///
    /// The write goes to a temp file first and is renamed into place, so a
    /// crash mid-write never leaves a half-written version behind.
    pub fn write_snapshot(&self, record: &SporeRecord) -> Result<u64> {
        let version = self.versions()?.last().map(|v| v + 1).unwrap_or(0);
        let path = self.path_for(version);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        info!(version, path = %path.display(), "seed snapshot written");
        Ok(version)
    }

    /// Load the latest readable snapshot, walking back over unreadable ones.
    pub fn load_latest(&self) -> Result<Option<SporeRecord>> {
        for version in self.versions()?.into_iter().rev() {
            match self.load_version(version) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    warn!(version, %err, "skipping unreadable seed snapshot");
                }
            }
        }
        Ok(None)
    }

    /// Load a specific snapshot version.
    pub fn load_version(&self, version: u64) -> Result<SporeRecord> {
        let bytes = fs::read(self.path_for(version))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Drop all but the newest `keep` snapshots.
    pub fn prune(&self, keep: usize) -> Result<()> {
        let versions = self.versions()?;
        if versions.len() <= keep {
            return Ok(());
        }
        for version in &versions[..versions.len() - keep] {
            fs::remove_file(self.path_for(*version))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SporeTier;
    use mycelia_identity::{NetworkIdentity, NodeKeypair};

    fn record(updated: u64) -> SporeRecord {
        let kp = NodeKeypair::generate();
        let network = NetworkIdentity::new_genesis("seed-net", vec![kp.node_id()]);
        SporeRecord::empty(SporeTier::Seed, network, &kp, updated).unwrap()
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::open(dir.path()).unwrap();

        let rec = record(1_000);
        let v = store.write_snapshot(&rec).unwrap();
        assert_eq!(v, 0);

        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[test]
    fn versions_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::open(dir.path()).unwrap();

        assert_eq!(store.write_snapshot(&record(1)).unwrap(), 0);
        assert_eq!(store.write_snapshot(&record(2)).unwrap(), 1);
        assert_eq!(store.write_snapshot(&record(3)).unwrap(), 2);
        assert_eq!(store.versions().unwrap(), vec![0, 1, 2]);
        assert_eq!(store.load_latest().unwrap().unwrap().last_updated, 3);
    }

    #[test]
    fn corrupted_latest_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::open(dir.path()).unwrap();

        store.write_snapshot(&record(1)).unwrap();
        store.write_snapshot(&record(2)).unwrap();
        std::fs::write(dir.path().join("seed-00000001.json"), b"not json").unwrap();

        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.last_updated, 1);
    }

    #[test]
    fn empty_store_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::open(dir.path()).unwrap();
        assert!(store.load_latest().unwrap().is_none());
    }

    #[test]
    fn prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeedStore::open(dir.path()).unwrap();
        for i in 0..5 {
            store.write_snapshot(&record(i)).unwrap();
        }
        store.prune(2).unwrap();
        assert_eq!(store.versions().unwrap(), vec![3, 4]);
    }
}
