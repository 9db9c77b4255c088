//! Instance lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a pooled instance.
///
/// Phases only move forward: Building → Idle → Claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, build not finished yet.
    Building,
    /// Built and scaled to zero, waiting for a claim.
    Idle,
    /// Handed to a user. Never re-enters the pool.
    Claimed,
}

impl Phase {
    /// Name suffix that marks this phase.
    pub const fn suffix(&self) -> &'static str {
        match self {
            Phase::Building => "b",
            Phase::Idle => "i",
            Phase::Claimed => "",
        }
    }

    /// Returns true if moving from `self` to `next` keeps phases monotonic.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        next > *self
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Building => write!(f, "building"),
            Phase::Idle => write!(f, "idle"),
            Phase::Claimed => write!(f, "claimed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_monotonic() {
        assert!(Phase::Building.can_advance_to(Phase::Idle));
        assert!(Phase::Idle.can_advance_to(Phase::Claimed));
        assert!(Phase::Building.can_advance_to(Phase::Claimed));

        assert!(!Phase::Claimed.can_advance_to(Phase::Idle));
        assert!(!Phase::Idle.can_advance_to(Phase::Building));
        assert!(!Phase::Idle.can_advance_to(Phase::Idle));
    }
}
