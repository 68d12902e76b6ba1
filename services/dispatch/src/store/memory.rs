//! In-memory [`DispatchStore`] implementation.
//!
//! The injected test double required by the concurrency model, and the
//! dev backend. All state sits behind a single async mutex, so every
//! composite operation the contract declares atomic is atomic here by
//! construction: nothing else can observe state between the check and
//! the write.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, SignupId, UserId};
use tokio::sync::Mutex;

use crate::capacity::{round_remaining, volunteer_remaining, CapacityPolicy};
use crate::domain::{
    Assignment, AssignmentStatus, CapacityConfig, Order, OrderEffect, OrderStatus, RateLimitRecord,
    Round, RoundStatus, Signup, SignupRole, SignupStatus,
};
use crate::error::{CapacityDetail, DispatchError, DispatchResult, RateLimitDetail};
use crate::store::DispatchStore;

#[derive(Default)]
struct State {
    orders: BTreeMap<OrderId, Order>,
    rounds: BTreeMap<RoundId, Round>,
    signups: BTreeMap<SignupId, Signup>,
    assignments: BTreeMap<AssignmentId, Assignment>,
    capacity_configs: BTreeMap<RoundId, CapacityConfig>,
    rate_limit_records: Vec<RateLimitRecord>,
}

impl State {
    fn count_confirmed_volunteers(&self, round_id: RoundId) -> i64 {
        self.signups
            .values()
            .filter(|s| {
                s.round_id == round_id
                    && s.role == SignupRole::Volunteer
                    && s.status == SignupStatus::Confirmed
            })
            .count() as i64
    }

    fn count_reserving_round(&self, round_id: RoundId) -> i64 {
        self.assignments
            .values()
            .filter(|a| a.round_id == round_id && a.status.reserves_capacity())
            .count() as i64
    }

    fn count_reserving_volunteer(&self, round_id: RoundId, volunteer_id: UserId) -> i64 {
        self.assignments
            .values()
            .filter(|a| {
                a.round_id == round_id
                    && a.volunteer_id == volunteer_id
                    && a.status.reserves_capacity()
            })
            .count() as i64
    }

    fn active_assignment_for_order(&self, order_id: OrderId) -> Option<&Assignment> {
        self.assignments
            .values()
            .find(|a| a.order_id == order_id && a.status.is_active())
    }
}

/// Process-local store backed by plain maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev helper: number of retained rate-limit records.
    pub async fn rate_limit_record_count(&self) -> usize {
        self.inner.lock().await.rate_limit_records.len()
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn rate_limit_counts(
        &self,
        requester_id: Option<UserId>,
        client_ip: &str,
        window_start: DateTime<Utc>,
    ) -> DispatchResult<(i64, i64)> {
        let state = self.inner.lock().await;
        let requester_count = match requester_id {
            Some(requester) => state
                .rate_limit_records
                .iter()
                .filter(|r| r.requester_id == Some(requester) && r.created_at >= window_start)
                .count() as i64,
            None => 0,
        };
        let ip_count = state
            .rate_limit_records
            .iter()
            .filter(|r| r.client_ip == client_ip && r.created_at >= window_start)
            .count() as i64;
        Ok((requester_count, ip_count))
    }

    async fn admit_and_insert_order(
        &self,
        order: Order,
        window_start: DateTime<Utc>,
        ceiling: i64,
        window_secs: i64,
    ) -> DispatchResult<Order> {
        let mut state = self.inner.lock().await;

        if let Some(requester) = order.requester_id {
            let count = state
                .rate_limit_records
                .iter()
                .filter(|r| r.requester_id == Some(requester) && r.created_at >= window_start)
                .count() as i64;
            if count >= ceiling {
                return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                    scope: "requester",
                    count,
                    ceiling,
                    window_secs,
                }));
            }
        }

        let ip_count = state
            .rate_limit_records
            .iter()
            .filter(|r| r.client_ip == order.client_ip && r.created_at >= window_start)
            .count() as i64;
        if ip_count >= ceiling {
            return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                scope: "ip",
                count: ip_count,
                ceiling,
                window_secs,
            }));
        }

        state.rate_limit_records.push(RateLimitRecord {
            requester_id: order.requester_id,
            client_ip: order.client_ip.clone(),
            created_at: order.created_at,
        });
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn delete_rate_limit_records_before(
        &self,
        horizon: DateTime<Utc>,
    ) -> DispatchResult<u64> {
        let mut state = self.inner.lock().await;
        let before = state.rate_limit_records.len();
        state.rate_limit_records.retain(|r| r.created_at >= horizon);
        Ok((before - state.rate_limit_records.len()) as u64)
    }

    async fn order(&self, id: OrderId) -> DispatchResult<Order> {
        let state = self.inner.lock().await;
        state
            .orders
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("order", id))
    }

    async fn pending_orders(&self, limit: i64, offset: i64) -> DispatchResult<Vec<Order>> {
        let state = self.inner.lock().await;
        let mut pending: Vec<&Order> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.round_id.is_none())
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(pending
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn insert_round(&self, round: Round) -> DispatchResult<Round> {
        let mut state = self.inner.lock().await;
        state.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn round(&self, id: RoundId) -> DispatchResult<Round> {
        let state = self.inner.lock().await;
        state
            .rounds
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("round", id))
    }

    async fn rounds_with_status(&self, status: RoundStatus) -> DispatchResult<Vec<Round>> {
        let state = self.inner.lock().await;
        let mut rounds: Vec<Round> = state
            .rounds
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        rounds.sort_by(|a, b| (a.starts_at, a.id).cmp(&(b.starts_at, b.id)));
        Ok(rounds)
    }

    async fn set_round_status(
        &self,
        id: RoundId,
        status: RoundStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut state = self.inner.lock().await;
        let round = state
            .rounds
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("round", id))?;
        round.status = status;
        round.updated_at = now;
        Ok(())
    }

    async fn capacity_config(&self, round_id: RoundId) -> DispatchResult<Option<CapacityConfig>> {
        let state = self.inner.lock().await;
        Ok(state.capacity_configs.get(&round_id).cloned())
    }

    async fn upsert_capacity_config(&self, config: CapacityConfig) -> DispatchResult<()> {
        let mut state = self.inner.lock().await;
        state.capacity_configs.insert(config.round_id, config);
        Ok(())
    }

    async fn insert_signup(
        &self,
        round_id: RoundId,
        user_id: UserId,
        role: SignupRole,
        now: DateTime<Utc>,
    ) -> DispatchResult<Signup> {
        let mut state = self.inner.lock().await;
        if !state.rounds.contains_key(&round_id) {
            return Err(DispatchError::not_found("round", round_id));
        }
        if state
            .signups
            .values()
            .any(|s| s.round_id == round_id && s.user_id == user_id)
        {
            return Err(DispatchError::conflict(format!(
                "user {user_id} already signed up for round {round_id}"
            )));
        }
        let lottery_number = state
            .signups
            .values()
            .filter(|s| s.round_id == round_id)
            .map(|s| s.lottery_number)
            .max()
            .unwrap_or(0)
            + 1;
        let signup = Signup {
            id: SignupId::new(),
            round_id,
            user_id,
            role,
            status: SignupStatus::Pending,
            lottery_number,
            created_at: now,
            updated_at: now,
        };
        state.signups.insert(signup.id, signup.clone());
        Ok(signup)
    }

    async fn signup(&self, id: SignupId) -> DispatchResult<Signup> {
        let state = self.inner.lock().await;
        state
            .signups
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("signup", id))
    }

    async fn round_signups(&self, round_id: RoundId) -> DispatchResult<Vec<Signup>> {
        let state = self.inner.lock().await;
        let mut signups: Vec<Signup> = state
            .signups
            .values()
            .filter(|s| s.round_id == round_id)
            .cloned()
            .collect();
        signups.sort_by_key(|s| s.lottery_number);
        Ok(signups)
    }

    async fn count_confirmed_volunteers(&self, round_id: RoundId) -> DispatchResult<i64> {
        let state = self.inner.lock().await;
        Ok(state.count_confirmed_volunteers(round_id))
    }

    async fn apply_signup_statuses(
        &self,
        updates: &[(SignupId, SignupStatus)],
        now: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut state = self.inner.lock().await;
        // Validate the whole batch before mutating anything.
        for (id, _) in updates {
            if !state.signups.contains_key(id) {
                return Err(DispatchError::not_found("signup", *id));
            }
        }
        for (id, status) in updates {
            if let Some(signup) = state.signups.get_mut(id) {
                signup.status = *status;
                signup.updated_at = now;
            }
        }
        Ok(())
    }

    async fn assignment(&self, id: AssignmentId) -> DispatchResult<Assignment> {
        let state = self.inner.lock().await;
        state
            .assignments
            .get(&id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found("assignment", id))
    }

    async fn round_assignments(&self, round_id: RoundId) -> DispatchResult<Vec<Assignment>> {
        let state = self.inner.lock().await;
        let mut assignments: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| a.round_id == round_id)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| a.id);
        Ok(assignments)
    }

    async fn count_reserving_round_assignments(&self, round_id: RoundId) -> DispatchResult<i64> {
        let state = self.inner.lock().await;
        Ok(state.count_reserving_round(round_id))
    }

    async fn count_reserving_volunteer_assignments(
        &self,
        round_id: RoundId,
        volunteer_id: UserId,
    ) -> DispatchResult<i64> {
        let state = self.inner.lock().await;
        Ok(state.count_reserving_volunteer(round_id, volunteer_id))
    }

    async fn reserving_counts_by_volunteer(
        &self,
        round_id: RoundId,
    ) -> DispatchResult<BTreeMap<UserId, i64>> {
        let state = self.inner.lock().await;
        let mut counts = BTreeMap::new();
        for assignment in state.assignments.values() {
            if assignment.round_id == round_id && assignment.status.reserves_capacity() {
                *counts.entry(assignment.volunteer_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn create_assignment_locked(
        &self,
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
        policy: CapacityPolicy,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut state = self.inner.lock().await;

        let order = state
            .orders
            .get(&order_id)
            .ok_or_else(|| DispatchError::not_found("order", order_id))?;
        if order.status != OrderStatus::Pending || order.round_id.is_some() {
            return Err(DispatchError::conflict(format!(
                "order {order_id} is not pending and unbound"
            )));
        }

        let round = state
            .rounds
            .get(&round_id)
            .ok_or_else(|| DispatchError::not_found("round", round_id))?;
        if round.status != RoundStatus::Scheduled {
            return Err(DispatchError::conflict(format!(
                "round {round_id} is not scheduled"
            )));
        }

        if state.active_assignment_for_order(order_id).is_some() {
            return Err(DispatchError::conflict(format!(
                "order {order_id} already has an active assignment"
            )));
        }

        let has_confirmed_signup = state.signups.values().any(|s| {
            s.round_id == round_id
                && s.user_id == volunteer_id
                && s.role == SignupRole::Volunteer
                && s.status == SignupStatus::Confirmed
        });
        if !has_confirmed_signup {
            return Err(DispatchError::Validation(format!(
                "volunteer {volunteer_id} has no confirmed signup for round {round_id}"
            )));
        }

        let confirmed = state.count_confirmed_volunteers(round_id);
        let round_reserving = state.count_reserving_round(round_id);
        if round_remaining(policy, confirmed, round_reserving) <= 0 {
            return Err(DispatchError::CapacityExceeded(CapacityDetail {
                round_id,
                volunteer_id: None,
                capacity: policy.round_capacity(confirmed),
                in_use: round_reserving,
            }));
        }

        let volunteer_reserving = state.count_reserving_volunteer(round_id, volunteer_id);
        if volunteer_remaining(policy, volunteer_reserving) <= 0 {
            return Err(DispatchError::CapacityExceeded(CapacityDetail {
                round_id,
                volunteer_id: Some(volunteer_id),
                capacity: i64::from(policy.max_orders_per_volunteer),
                in_use: volunteer_reserving,
            }));
        }

        let assignment = Assignment::offered(order_id, volunteer_id, round_id, now);
        state.assignments.insert(assignment.id, assignment.clone());
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| DispatchError::not_found("order", order_id))?;
        order.status = OrderStatus::Assigned;
        order.round_id = Some(round_id);
        order.updated_at = now;

        Ok(assignment)
    }

    async fn transition_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
        expected_status: AssignmentStatus,
        target: AssignmentStatus,
        effect: OrderEffect,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment> {
        let mut state = self.inner.lock().await;

        let assignment = state
            .assignments
            .get_mut(&id)
            .ok_or_else(|| DispatchError::not_found("assignment", id))?;
        if assignment.version != expected_version || assignment.status != expected_status {
            return Err(DispatchError::conflict(format!(
                "stale read for assignment {id}: supplied version {expected_version} ({expected_status}), stored {} ({})",
                assignment.version, assignment.status
            )));
        }

        assignment.status = target;
        assignment.version += 1;
        assignment.updated_at = now;
        match target {
            AssignmentStatus::Accepted => assignment.accepted_at = Some(now),
            AssignmentStatus::Completed => assignment.completed_at = Some(now),
            _ => {}
        }
        let updated = assignment.clone();

        if let Some(order) = state.orders.get_mut(&updated.order_id) {
            match effect {
                OrderEffect::None => {}
                OrderEffect::Started => {
                    order.status = OrderStatus::InProgress;
                    order.updated_at = now;
                }
                OrderEffect::Completed => {
                    order.status = OrderStatus::Completed;
                    order.updated_at = now;
                }
                OrderEffect::Requeued => {
                    if order.status != OrderStatus::Completed {
                        order.status = OrderStatus::Pending;
                        order.round_id = None;
                        order.updated_at = now;
                    }
                }
            }
        }

        Ok(updated)
    }
}
