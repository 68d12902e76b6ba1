//! Persistence contract for the dispatch engine.
//!
//! [`DispatchStore`] is the narrow interface the engine consumes from
//! durable storage: ordered range queries, aggregate counts by
//! status/role, an exclusive per-order lock scoped to one atomic
//! operation, and a compare-and-increment on the assignment version.
//!
//! Two implementations ship: [`memory::MemoryStore`], the injected
//! test double and dev backend, and [`postgres::PgStore`] on
//! SQLx/Postgres. Nothing outside this module names SQLx types except
//! the error enum.
//!
//! Operations that must be atomic are modelled as single composite
//! methods (`admit_and_insert_order`,
//! `create_assignment_locked`, `transition_assignment`) so each
//! backend can supply its own atomicity mechanism: one transaction in
//! Postgres, one mutex hold in memory.

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, SignupId, UserId};

use crate::capacity::CapacityPolicy;
use crate::domain::{
    Assignment, AssignmentStatus, CapacityConfig, Order, OrderEffect, Round, RoundStatus, Signup,
    SignupRole, SignupStatus,
};
use crate::error::DispatchResult;

pub use postgres::{DbConfig, PgStore};

/// Durable storage operations consumed by the engine.
#[async_trait]
pub trait DispatchStore: Send + Sync {
    // ------------------------------------------------------------------
    // Orders and rate limiting
    // ------------------------------------------------------------------

    /// Counts order-creation attempts since `window_start` for the
    /// given requester (if any) and for the given IP, independently.
    /// Returns `(requester_count, ip_count)`; the requester count is 0
    /// for guest identities.
    async fn rate_limit_counts(
        &self,
        requester_id: Option<UserId>,
        client_ip: &str,
        window_start: DateTime<Utc>,
    ) -> DispatchResult<(i64, i64)>;

    /// Admission check and order creation as one atomic step: counts
    /// attempts inside the window, rejects with `RateLimitExceeded` if
    /// either identity reached `ceiling`, otherwise appends the
    /// attempt record and persists the order. Concurrent bursts from
    /// one identity cannot all pass.
    async fn admit_and_insert_order(
        &self,
        order: Order,
        window_start: DateTime<Utc>,
        ceiling: i64,
        window_secs: i64,
    ) -> DispatchResult<Order>;

    /// Deletes rate-limit records created before `horizon`. Returns
    /// the number removed.
    async fn delete_rate_limit_records_before(&self, horizon: DateTime<Utc>)
        -> DispatchResult<u64>;

    async fn order(&self, id: OrderId) -> DispatchResult<Order>;

    /// Pending, round-unbound orders strictly by arrival time
    /// ascending (ties broken by id, which is itself time-ordered).
    /// Pure read, restartable, paged.
    async fn pending_orders(&self, limit: i64, offset: i64) -> DispatchResult<Vec<Order>>;

    // ------------------------------------------------------------------
    // Rounds and capacity config
    // ------------------------------------------------------------------

    async fn insert_round(&self, round: Round) -> DispatchResult<Round>;

    async fn round(&self, id: RoundId) -> DispatchResult<Round>;

    async fn rounds_with_status(&self, status: RoundStatus) -> DispatchResult<Vec<Round>>;

    async fn set_round_status(
        &self,
        id: RoundId,
        status: RoundStatus,
        now: DateTime<Utc>,
    ) -> DispatchResult<()>;

    async fn capacity_config(&self, round_id: RoundId) -> DispatchResult<Option<CapacityConfig>>;

    async fn upsert_capacity_config(&self, config: CapacityConfig) -> DispatchResult<()>;

    // ------------------------------------------------------------------
    // Signups
    // ------------------------------------------------------------------

    /// Creates a signup with the next lottery number for the round
    /// (totally ordered, assigned once, never reused). Fails with
    /// `Conflict` on a duplicate (round, user) pair and `NotFound` for
    /// an unknown round.
    async fn insert_signup(
        &self,
        round_id: RoundId,
        user_id: UserId,
        role: SignupRole,
        now: DateTime<Utc>,
    ) -> DispatchResult<Signup>;

    async fn signup(&self, id: SignupId) -> DispatchResult<Signup>;

    async fn round_signups(&self, round_id: RoundId) -> DispatchResult<Vec<Signup>>;

    /// Count of CONFIRMED signups with role VOLUNTEER for the round.
    async fn count_confirmed_volunteers(&self, round_id: RoundId) -> DispatchResult<i64>;

    /// Applies a batch of lottery status decisions in one atomic step.
    async fn apply_signup_statuses(
        &self,
        updates: &[(SignupId, SignupStatus)],
        now: DateTime<Utc>,
    ) -> DispatchResult<()>;

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    async fn assignment(&self, id: AssignmentId) -> DispatchResult<Assignment>;

    async fn round_assignments(&self, round_id: RoundId) -> DispatchResult<Vec<Assignment>>;

    /// Count of capacity-reserving assignments in the round.
    async fn count_reserving_round_assignments(&self, round_id: RoundId) -> DispatchResult<i64>;

    /// Count of the volunteer's capacity-reserving assignments in the
    /// round.
    async fn count_reserving_volunteer_assignments(
        &self,
        round_id: RoundId,
        volunteer_id: UserId,
    ) -> DispatchResult<i64>;

    /// Capacity-reserving assignment counts grouped by volunteer.
    /// `BTreeMap` so iteration order is lowest user id first, which the
    /// scheduler's tie-break relies on.
    async fn reserving_counts_by_volunteer(
        &self,
        round_id: RoundId,
    ) -> DispatchResult<BTreeMap<UserId, i64>>;

    /// Creates a `PendingAccept` assignment while holding an exclusive
    /// lock on the order row for the whole read-check-write.
    ///
    /// Under the lock: the order must exist, be `Pending`, and have no
    /// round bound; the round must exist and be `Scheduled`; the
    /// volunteer must hold a CONFIRMED volunteer signup; no active
    /// assignment may exist for the order (`Conflict` otherwise); and
    /// both round-level and volunteer-level remaining capacity under
    /// `policy` must be positive (`CapacityExceeded` otherwise).
    /// On success the order is bound to the round and set `Assigned`
    /// in the same atomic step.
    async fn create_assignment_locked(
        &self,
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
        policy: CapacityPolicy,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment>;

    /// Compare-and-increment transition: moves the assignment to
    /// `target` only if its stored version equals `expected_version`
    /// AND its stored status equals `expected_status` (the state the
    /// caller validated the transition from), incrementing the version
    /// and stamping `accepted_at` / `completed_at` / `updated_at` as
    /// appropriate. A stale version or status mutates nothing and
    /// returns `Conflict`. `effect` is applied to the bound order in
    /// the same atomic step.
    async fn transition_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
        expected_status: AssignmentStatus,
        target: AssignmentStatus,
        effect: OrderEffect,
        now: DateTime<Utc>,
    ) -> DispatchResult<Assignment>;
}
