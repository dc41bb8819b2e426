//! Trust scoring subsystem.
//!
//! Converts consensus participation history into a bounded, slowly-changing
//! reputation value used to weight votes and gate round eligibility.
//!
//! Design rules enforced here:
//!
//! - every score lives in [0.0, 1.0], re-clamped after every update
//! - all mutation funnels through [`TrustTable::record_event`] /
//!   [`TrustTable::apply_idle_decay`] - no component sets scores directly
//! - the only positive delta is small, so recovering from below the
//!   eligibility floor always takes sustained participation

mod error;
mod score;
mod table;

pub use error::{Error, Result};
pub use score::TrustScore;
pub use table::{ParticipationMetrics, TrustConfig, TrustEvent, TrustTable};
