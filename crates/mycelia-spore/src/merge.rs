//! Authority-and-freshness merge rules.
//!
//! Two levels of merging:
//!
//! - **within a tier**: last-writer-wins by `last_updated`, ties broken by
//!   comparing signature bytes (deterministic, not security-relevant)
//! - **across tiers**: prefer the higher-authority tier unless its record is
//!   older than a lower tier's by more than the staleness bound, in which
//!   case fall back to the next tier down
//!
//! Both are pure functions of their inputs: merging is deterministic and
//! idempotent, which is what makes the three tiers eventually converge once
//! they can communicate. Signature validation happens at ingest (see
//! [`crate::SporeView`]); records held in tiers are already validated.

use std::collections::BTreeMap;

use tracing::debug;

use mycelia_identity::NodeId;

use crate::record::{NodeIdentity, SporeRecord, SporeTier};

/// Tunables for the merge rules.
#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    /// How much older (millis) a higher tier may be than a lower tier
    /// before the lower tier wins.
    pub staleness_bound_millis: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            staleness_bound_millis: 300_000,
        }
    }
}

impl MergeConfig {
    /// Set the staleness bound.
    #[must_use]
    pub fn with_staleness_bound(mut self, millis: u64) -> Self {
        self.staleness_bound_millis = millis;
        self
    }
}

/// Whether `incoming` supersedes `current` within the same tier.
///
/// Last-writer-wins by `last_updated`; exact ties fall to signature byte
/// order so both sides of an exchange settle on the same record.
pub fn supersedes(incoming: &SporeRecord, current: &SporeRecord) -> bool {
    match incoming.last_updated.cmp(&current.last_updated) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            incoming.signature.to_bytes() > current.signature.to_bytes()
        }
    }
}

/// Merge an incoming record into a tier slot. Returns true if it replaced.
pub fn merge_within_tier(slot: &mut Option<SporeRecord>, incoming: SporeRecord) -> bool {
    match slot {
        Some(current) => {
            if supersedes(&incoming, current) {
                *slot = Some(incoming);
                true
            } else {
                false
            }
        }
        None => {
            *slot = Some(incoming);
            true
        }
    }
}

/// Select the authoritative record across tiers.
///
/// Walks tiers in descending authority; a tier is skipped when some lower
/// tier is fresher by more than the staleness bound. The lowest available
/// tier is never skipped - a best-effort view beats no view.
pub fn select_authoritative<'a>(
    tiers: &'a [(SporeTier, Option<SporeRecord>); 3],
    config: &MergeConfig,
) -> Option<(SporeTier, &'a SporeRecord)> {
    let present: Vec<(SporeTier, &SporeRecord)> = tiers
        .iter()
        .filter_map(|(tier, slot)| slot.as_ref().map(|r| (*tier, r)))
        .collect();

    for (i, (tier, record)) in present.iter().enumerate() {
        let stale = present[i + 1..].iter().any(|(_, lower)| {
            lower.last_updated > record.last_updated.saturating_add(config.staleness_bound_millis)
        });
        if stale {
            debug!(tier = %tier, "tier record stale beyond bound, falling back");
            continue;
        }
        return Some((*tier, record));
    }
    // All higher tiers were stale relative to something below them; the
    // last tier has nothing below it and wins by construction, so reaching
    // here means no tier holds a record at all.
    present.last().map(|(t, r)| (*t, *r))
}

/// Compute the merged per-entity view across tiers.
///
/// Applies the same authority-and-freshness rule per node id: an entity's
/// entry comes from the highest-authority tier holding it, unless that
/// tier's record is stale (beyond the bound) relative to a lower tier that
/// also holds the entity.
pub fn merged_entries(
    tiers: &[(SporeTier, Option<SporeRecord>); 3],
    config: &MergeConfig,
) -> BTreeMap<NodeId, NodeIdentity> {
    let mut merged: BTreeMap<NodeId, NodeIdentity> = BTreeMap::new();

    // Gather, per entity, the (tier, record freshness, entry) candidates in
    // authority order, then apply the fallback rule.
    let mut candidates: BTreeMap<NodeId, Vec<(SporeTier, u64, &NodeIdentity)>> = BTreeMap::new();
    for (tier, slot) in tiers {
        if let Some(record) = slot {
            for (id, entry) in &record.nodes {
                candidates
                    .entry(*id)
                    .or_default()
                    .push((*tier, record.last_updated, entry));
            }
        }
    }

    for (id, mut cands) in candidates {
        cands.sort_by(|a, b| b.0.authority().cmp(&a.0.authority()));
        let chosen = cands
            .iter()
            .enumerate()
            .find(|(i, (_, updated, _))| {
                !cands[i + 1..].iter().any(|(_, lower_updated, _)| {
                    *lower_updated > updated.saturating_add(config.staleness_bound_millis)
                })
            })
            .map(|(_, c)| c)
            .or_else(|| cands.last());
        if let Some((_, _, entry)) = chosen {
            merged.insert(id, (*entry).clone());
        }
    }

    merged
}
