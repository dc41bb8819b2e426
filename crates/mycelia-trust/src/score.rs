//! The bounded trust score type.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A reputation value constrained to [0.0, 1.0].
///
/// Every update path goes through [`TrustScore::apply`], which re-clamps,
/// so a score can never leave the range regardless of the delta fed in.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustScore(f64);

impl TrustScore {
    /// Lowest possible score.
    pub const MIN: TrustScore = TrustScore(0.0);
    /// Highest possible score.
    pub const MAX: TrustScore = TrustScore(1.0);

    /// Create a score, rejecting values outside [0.0, 1.0].
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(Error::OutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Create a score, clamping into range. Non-finite input clamps to 0.
    pub fn clamped(value: f64) -> Self {
        if value.is_finite() {
            Self(value.clamp(0.0, 1.0))
        } else {
            Self(0.0)
        }
    }

    /// The raw value.
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Apply a signed delta, clamping the result into [0.0, 1.0].
    #[must_use]
    pub fn apply(&self, delta: f64) -> Self {
        Self::clamped(self.0 + delta)
    }

    /// Whether this score meets a threshold.
    pub fn meets(&self, threshold: f64) -> bool {
        self.0 >= threshold
    }
}

impl std::fmt::Display for TrustScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}
