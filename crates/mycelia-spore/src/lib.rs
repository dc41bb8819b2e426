//! Three-tier spore discovery: who is in the network, and how much do we
//! trust them.
//!
//! Membership state is replicated through three independent mechanisms,
//! in descending authority:
//!
//! - **Primary** ([`PrimaryLog`]): an append-only command log among backbone
//!   nodes, materialized into a signed record
//! - **Seed** ([`SeedStore`]): periodic durable snapshots, the bootstrap and
//!   recovery anchor
//! - **Latent** ([`gossip`]): pairwise anti-entropy exchange, available even
//!   when the higher tiers are not
//!
//! A [`SporeView`] holds the node's copy of all three and answers membership
//! queries through the authority-and-freshness merge rules in [`merge`]: a
//! higher tier wins unless a lower tier is fresher by more than the
//! staleness bound. All records are Ed25519-signed by an authorized node and
//! validated at ingest.

pub mod error;
pub mod gossip;
pub mod merge;
pub mod primary;
pub mod record;
pub mod seed;
pub mod view;

pub use error::{Error, Result};
pub use gossip::GossipMessage;
pub use merge::MergeConfig;
pub use primary::{LogCommand, LogEntry, PrimaryLog};
pub use record::{
    AbsenceReason, ActivityInterval, NodeIdentity, OfflineInfo, ServiceEndpoint, SporeRecord,
    SporeTier, SCHEMA_VERSION,
};
pub use seed::SeedStore;
pub use view::{RegistrationRequest, SporeView};
