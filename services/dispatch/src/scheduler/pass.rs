//! A single allocation pass over all scheduled rounds.
//!
//! For each scheduled round the pass walks the pending-order queue
//! oldest-first and offers orders to confirmed volunteers,
//! lowest-load-first with ties broken by lowest user id, until round
//! capacity or the queue runs out. One round's failure never aborts
//! the others; one order's conflict never aborts its round.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rounds_id::{RoundId, UserId};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::capacity::{round_remaining, CapacityPolicy};
use crate::domain::{RoundStatus, SignupRole, SignupStatus};
use crate::error::DispatchResult;
use crate::store::DispatchStore;

/// Counters for one allocation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub rounds_processed: usize,
    pub rounds_failed: usize,
    pub orders_assigned: usize,
    pub orders_skipped: usize,
}

#[derive(Clone)]
pub struct AllocationPass {
    store: Arc<dyn DispatchStore>,
    page_size: i64,
}

impl AllocationPass {
    pub fn new(store: Arc<dyn DispatchStore>, page_size: i64) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Run one pass. Checks `cancel` between rounds and between queue
    /// pages; a cancelled pass returns the stats accumulated so far.
    pub async fn run(&self, cancel: &watch::Receiver<bool>) -> DispatchResult<PassStats> {
        let mut stats = PassStats::default();
        let rounds = self.store.rounds_with_status(RoundStatus::Scheduled).await?;
        debug!(rounds = rounds.len(), "Allocation pass started");

        for round in rounds {
            if *cancel.borrow() {
                info!("Allocation pass cancelled");
                break;
            }
            match self.allocate_round(round.id, cancel, &mut stats).await {
                Ok(()) => stats.rounds_processed += 1,
                Err(e) => {
                    stats.rounds_failed += 1;
                    warn!(round_id = %round.id, error = %e, "Round allocation failed");
                }
            }
        }

        info!(
            rounds_processed = stats.rounds_processed,
            rounds_failed = stats.rounds_failed,
            orders_assigned = stats.orders_assigned,
            orders_skipped = stats.orders_skipped,
            "Allocation pass finished"
        );
        Ok(stats)
    }

    async fn allocate_round(
        &self,
        round_id: RoundId,
        cancel: &watch::Receiver<bool>,
        stats: &mut PassStats,
    ) -> DispatchResult<()> {
        let config = self.store.capacity_config(round_id).await?;
        let policy = CapacityPolicy::from_config(config.as_ref());

        // Seed every confirmed volunteer at zero so idle volunteers are
        // eligible, then overlay the held-assignment counts.
        let signups = self.store.round_signups(round_id).await?;
        let mut loads: BTreeMap<UserId, i64> = signups
            .iter()
            .filter(|s| s.role == SignupRole::Volunteer && s.status == SignupStatus::Confirmed)
            .map(|s| (s.user_id, 0))
            .collect();
        for (volunteer, held) in self.store.reserving_counts_by_volunteer(round_id).await? {
            if let Some(load) = loads.get_mut(&volunteer) {
                *load = held;
            }
        }
        if loads.is_empty() {
            debug!(round_id = %round_id, "No confirmed volunteers, skipping round");
            return Ok(());
        }

        let confirmed = loads.len() as i64;
        let reserving = self.store.count_reserving_round_assignments(round_id).await?;
        let mut remaining = round_remaining(policy, confirmed, reserving);

        let mut offset = 0;
        'queue: while remaining > 0 {
            if *cancel.borrow() {
                break;
            }
            let page = self.store.pending_orders(self.page_size, offset).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            let mut assigned_in_page = 0;

            for order in page {
                // Cooperative cancellation between orders, never
                // mid-transaction.
                if *cancel.borrow() {
                    break 'queue;
                }
                if remaining <= 0 {
                    break 'queue;
                }
                let Some(volunteer) = pick_volunteer(&loads, policy.max_orders_per_volunteer)
                else {
                    // Every volunteer is at their cap.
                    break 'queue;
                };

                match self
                    .store
                    .create_assignment_locked(order.id, volunteer, round_id, policy, Utc::now())
                    .await
                {
                    Ok(assignment) => {
                        stats.orders_assigned += 1;
                        assigned_in_page += 1;
                        remaining -= 1;
                        if let Some(load) = loads.get_mut(&volunteer) {
                            *load += 1;
                        }
                        debug!(
                            assignment_id = %assignment.id,
                            order_id = %order.id,
                            volunteer_id = %volunteer,
                            round_id = %round_id,
                            "Order assigned"
                        );
                    }
                    // A concurrent claim or capacity race skips the
                    // order; the next pass retries anything still
                    // pending.
                    Err(e) if e.is_conflict() || e.is_capacity_exceeded() => {
                        stats.orders_skipped += 1;
                        debug!(order_id = %order.id, error = %e, "Order skipped");
                    }
                    Err(e) => return Err(e),
                }
            }

            // Assigned orders leave the pending query's result set;
            // advance past only the ones that might still be in it.
            offset += (page_len - assigned_in_page) as i64;
            if assigned_in_page == 0 && page_len < self.page_size as usize {
                break;
            }
        }

        Ok(())
    }
}

/// Lowest current load wins; ties go to the lowest user id. Volunteers
/// at the per-volunteer cap are ineligible.
fn pick_volunteer(loads: &BTreeMap<UserId, i64>, max_per_volunteer: i32) -> Option<UserId> {
    loads
        .iter()
        .filter(|(_, load)| **load < i64::from(max_per_volunteer))
        .min_by_key(|(id, load)| (**load, **id))
        .map(|(id, _)| *id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volunteer_selection_prefers_lowest_load_then_lowest_id() {
        let mut ids: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        ids.sort();

        let mut loads = BTreeMap::new();
        loads.insert(ids[0], 2);
        loads.insert(ids[1], 1);
        loads.insert(ids[2], 1);

        // ids[1] and ids[2] tie on load; the lower id wins.
        assert_eq!(pick_volunteer(&loads, 3), Some(ids[1]));
    }

    #[test]
    fn volunteers_at_cap_are_ineligible() {
        let id = UserId::new();
        let mut loads = BTreeMap::new();
        loads.insert(id, 3);
        assert_eq!(pick_volunteer(&loads, 3), None);
        assert_eq!(pick_volunteer(&loads, 4), Some(id));
    }
}
