//! Free-tier classification
//!
//! Whether a signup rides free is always derived from its live position.
//! `SignupRecord::cached_is_free` is a display hint and is never read here.

use serde::{Deserialize, Serialize};

use crate::persistence::SignupRecord;

/// Default number of free positions
pub const DEFAULT_FREE_TIER_THRESHOLD: i64 = 20;

/// `true` iff a position has been assigned and is within the threshold
pub fn is_free(position: Option<i64>, threshold: i64) -> bool {
    position.is_some_and(|p| p <= threshold)
}

/// Tier of a signup as computed from its current position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub enum MembershipTier {
    /// Position within the free threshold
    Free,
    /// Position beyond the free threshold
    Paid,
    /// Member still waiting for a position
    Unallocated,
    /// Administrator, outside the sequence
    Excluded,
}

impl MembershipTier {
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// The configured free-tier cutoff
///
/// Changing the threshold applies retroactively: every read reclassifies
/// against the value in effect at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeTierPolicy {
    pub threshold: i64,
}

impl Default for FreeTierPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FREE_TIER_THRESHOLD)
    }
}

impl FreeTierPolicy {
    pub fn new(threshold: i64) -> Self {
        Self {
            threshold: threshold.max(0),
        }
    }

    pub fn is_free(&self, position: Option<i64>) -> bool {
        is_free(position, self.threshold)
    }

    /// Live tier of a record
    pub fn classify(&self, record: &SignupRecord) -> MembershipTier {
        if !record.role.is_member() {
            return MembershipTier::Excluded;
        }
        match record.position {
            None => MembershipTier::Unallocated,
            Some(_) if self.is_free(record.position) => MembershipTier::Free,
            Some(_) => MembershipTier::Paid,
        }
    }

    /// Live free/paid decision for a record
    pub fn is_free_record(&self, record: &SignupRecord) -> bool {
        self.classify(record).is_free()
    }
}
