//! Capacity configuration access and remaining-capacity calculation.
//!
//! Round capacity is either the administrator override or
//! `max_orders_per_volunteer × confirmed volunteers`. Remaining
//! capacity subtracts every capacity-reserving assignment
//! (`PendingAccept` offers included, since they are in-flight offers
//! not yet rejected). Counts are recomputed from current rows on every
//! check, never cached.

use std::sync::Arc;

use rounds_id::{RoundId, UserId};

use crate::domain::{CapacityConfig, DEFAULT_MAX_ORDERS_PER_VOLUNTEER};
use crate::error::DispatchResult;
use crate::store::DispatchStore;

/// The capacity knobs in effect for one round, resolved from the
/// stored [`CapacityConfig`] or defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub max_orders_per_volunteer: i32,
    pub override_capacity: Option<i32>,
}

impl CapacityPolicy {
    pub fn from_config(config: Option<&CapacityConfig>) -> Self {
        match config {
            Some(config) => Self {
                max_orders_per_volunteer: config.max_orders_per_volunteer,
                override_capacity: config.override_capacity,
            },
            None => Self::default(),
        }
    }

    /// Total round capacity given the current confirmed volunteer
    /// count. The override, when set, wins regardless of roster size.
    pub fn round_capacity(&self, confirmed_volunteers: i64) -> i64 {
        match self.override_capacity {
            Some(cap) => i64::from(cap),
            None => i64::from(self.max_orders_per_volunteer) * confirmed_volunteers,
        }
    }
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            max_orders_per_volunteer: DEFAULT_MAX_ORDERS_PER_VOLUNTEER,
            override_capacity: None,
        }
    }
}

/// Round remaining = capacity − reserving assignments. May go negative
/// when an override is lowered after assignments exist; callers treat
/// anything ≤ 0 as full.
pub fn round_remaining(policy: CapacityPolicy, confirmed_volunteers: i64, reserving: i64) -> i64 {
    policy.round_capacity(confirmed_volunteers) - reserving
}

/// Volunteer remaining = per-volunteer cap − that volunteer's
/// reserving assignments in the round.
pub fn volunteer_remaining(policy: CapacityPolicy, reserving_for_volunteer: i64) -> i64 {
    i64::from(policy.max_orders_per_volunteer) - reserving_for_volunteer
}

/// Store-backed capacity queries, shared by the scheduler and the
/// interactive surface.
#[derive(Clone)]
pub struct CapacityCalculator {
    store: Arc<dyn DispatchStore>,
}

impl CapacityCalculator {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// The policy currently in effect for the round.
    pub async fn policy(&self, round_id: RoundId) -> DispatchResult<CapacityPolicy> {
        let config = self.store.capacity_config(round_id).await?;
        Ok(CapacityPolicy::from_config(config.as_ref()))
    }

    /// Remaining round-level slots, from current rows.
    pub async fn round_remaining_capacity(&self, round_id: RoundId) -> DispatchResult<i64> {
        let policy = self.policy(round_id).await?;
        let confirmed = self.store.count_confirmed_volunteers(round_id).await?;
        let reserving = self
            .store
            .count_reserving_round_assignments(round_id)
            .await?;
        Ok(round_remaining(policy, confirmed, reserving))
    }

    /// Remaining slots for one volunteer in one round.
    pub async fn volunteer_remaining_capacity(
        &self,
        round_id: RoundId,
        volunteer_id: UserId,
    ) -> DispatchResult<i64> {
        let policy = self.policy(round_id).await?;
        let reserving = self
            .store
            .count_reserving_volunteer_assignments(round_id, volunteer_id)
            .await?;
        Ok(volunteer_remaining(policy, reserving))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn derived_capacity_multiplies_confirmed_volunteers() {
        let policy = CapacityPolicy::default();
        assert_eq!(policy.round_capacity(0), 0);
        assert_eq!(policy.round_capacity(2), 6);
        assert_eq!(policy.round_capacity(5), 15);
    }

    #[test]
    fn override_supersedes_formula() {
        let policy = CapacityPolicy {
            max_orders_per_volunteer: 3,
            override_capacity: Some(4),
        };
        assert_eq!(policy.round_capacity(0), 4);
        assert_eq!(policy.round_capacity(10), 4);
    }

    #[test]
    fn policy_from_stored_config() {
        let mut config = CapacityConfig::default_for(RoundId::new(), Utc::now());
        config.max_orders_per_volunteer = 5;
        config.override_capacity = Some(12);
        let policy = CapacityPolicy::from_config(Some(&config));
        assert_eq!(policy.max_orders_per_volunteer, 5);
        assert_eq!(policy.override_capacity, Some(12));

        assert_eq!(CapacityPolicy::from_config(None), CapacityPolicy::default());
    }

    #[test]
    fn remaining_goes_negative_when_over_committed() {
        let policy = CapacityPolicy {
            max_orders_per_volunteer: 3,
            override_capacity: Some(4),
        };
        assert_eq!(round_remaining(policy, 2, 4), 0);
        assert_eq!(round_remaining(policy, 2, 6), -2);
        assert_eq!(volunteer_remaining(policy, 3), 0);
        assert_eq!(volunteer_remaining(policy, 1), 2);
    }
}
