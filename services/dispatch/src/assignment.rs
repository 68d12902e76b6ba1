//! Assignment lifecycle engine.
//!
//! Creation funnels through the store's order-locked composite
//! operation; transitions use optimistic concurrency on the assignment
//! version. Each successful transition carries its order-side effect in
//! the same atomic step:
//!
//! - accept: no order change (already `Assigned`)
//! - start: order `InProgress`
//! - complete: order `Completed`
//! - cancel: order back to `Pending` and unbound, unless completed

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, UserId};
use tracing::info;

use crate::capacity::CapacityPolicy;
use crate::domain::{Assignment, AssignmentStatus, OrderEffect};
use crate::error::{DispatchError, DispatchResult};
use crate::store::DispatchStore;

#[derive(Clone)]
pub struct AssignmentEngine {
    store: Arc<dyn DispatchStore>,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// Offer an order to a volunteer. All preconditions (order pending
    /// and unbound, round scheduled, confirmed signup, no active
    /// assignment, round and volunteer capacity) are checked under the
    /// store's order lock.
    pub async fn create(
        &self,
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let config = self.store.capacity_config(round_id).await?;
        let policy = CapacityPolicy::from_config(config.as_ref());

        let assignment = self
            .store
            .create_assignment_locked(order_id, volunteer_id, round_id, policy, now)
            .await?;

        info!(
            assignment_id = %assignment.id,
            order_id = %order_id,
            volunteer_id = %volunteer_id,
            round_id = %round_id,
            "Assignment offered"
        );
        Ok(assignment)
    }

    /// `PendingAccept` → `Accepted`.
    pub async fn accept(
        &self,
        id: AssignmentId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        self.transition(id, expected_version, AssignmentStatus::Accepted, now)
            .await
    }

    /// `Accepted` → `InProgress`; the order follows.
    pub async fn start(
        &self,
        id: AssignmentId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        self.transition(id, expected_version, AssignmentStatus::InProgress, now)
            .await
    }

    /// `InProgress` → `Completed`; the order follows.
    pub async fn complete(
        &self,
        id: AssignmentId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        self.transition(id, expected_version, AssignmentStatus::Completed, now)
            .await
    }

    /// Cancel from any non-terminal state; the order returns to the
    /// dispatch queue. Cancelling an already-cancelled assignment is an
    /// idempotent no-op returning the current row.
    pub async fn cancel(
        &self,
        id: AssignmentId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let current = self.store.assignment(id).await?;
        if current.status == AssignmentStatus::Cancelled {
            return Ok(current);
        }
        self.transition(id, expected_version, AssignmentStatus::Cancelled, now)
            .await
    }

    async fn transition(
        &self,
        id: AssignmentId,
        expected_version: i64,
        target: AssignmentStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let current = self.store.assignment(id).await?;
        if !current.status.can_transition_to(target) {
            return Err(DispatchError::conflict(format!(
                "assignment {id} cannot move from {} to {}",
                current.status, target
            )));
        }

        let effect = match target {
            AssignmentStatus::Accepted | AssignmentStatus::PendingAccept => OrderEffect::None,
            AssignmentStatus::InProgress => OrderEffect::Started,
            AssignmentStatus::Completed => OrderEffect::Completed,
            AssignmentStatus::Cancelled => OrderEffect::Requeued,
        };

        // The CAS below re-checks version and source status together;
        // a concurrent transition between the read above and this
        // write surfaces as Conflict, never as a repeated transition.
        let updated = self
            .store
            .transition_assignment(id, expected_version, current.status, target, effect, now)
            .await?;

        info!(
            assignment_id = %id,
            from = %current.status,
            to = %target,
            version = updated.version,
            "Assignment transitioned"
        );
        Ok(updated)
    }
}
