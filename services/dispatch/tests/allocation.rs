//! Scheduler allocation passes: FIFO order, capacity limits, volunteer
//! spread, and isolation of unallocatable work.

mod common;

use common::{guest_order, harness, scheduled_round, volunteer};
use rounds_dispatch::domain::{AssignmentStatus, OrderStatus};
use rounds_dispatch::scheduler::PassOutcome;

async fn run_pass(h: &common::Harness) -> rounds_dispatch::scheduler::PassStats {
    match h.service.run_allocation_pass().await.expect("pass runs") {
        PassOutcome::Completed(stats) => stats,
        PassOutcome::AlreadyRunning => panic!("no concurrent pass in these tests"),
    }
}

#[tokio::test]
async fn oldest_orders_are_allocated_first() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    let (_volunteer_id, _) = volunteer(&h, round.id).await;

    // One volunteer holds at most three orders; the fourth (newest)
    // must stay pending.
    let orders = [
        guest_order(&h).await,
        guest_order(&h).await,
        guest_order(&h).await,
        guest_order(&h).await,
    ];

    let stats = run_pass(&h).await;
    assert_eq!(stats.rounds_processed, 1);
    assert_eq!(stats.orders_assigned, 3);

    for order in &orders[..3] {
        let current = h.service.order(order.id).await.expect("order");
        assert_eq!(current.status, OrderStatus::Assigned, "order {}", order.id);
        assert_eq!(current.round_id, Some(round.id));
    }
    let newest = h.service.order(orders[3].id).await.expect("order");
    assert_eq!(newest.status, OrderStatus::Pending);
    assert!(newest.round_id.is_none());
}

#[tokio::test]
async fn capacity_override_caps_the_round() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    volunteer(&h, round.id).await;
    volunteer(&h, round.id).await;
    h.service
        .set_capacity_config(round.id, 3, Some(4), None)
        .await
        .expect("config set");

    for _ in 0..6 {
        guest_order(&h).await;
    }

    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 4);
    assert_eq!(
        h.service
            .round_remaining_capacity(round.id)
            .await
            .expect("capacity"),
        0
    );

    // Raising the override frees slots for the next pass.
    h.service
        .set_capacity_config(round.id, 3, Some(6), None)
        .await
        .expect("config raised");
    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 2);
}

#[tokio::test]
async fn direct_claims_against_a_full_round_are_rejected() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    let (a, _) = volunteer(&h, round.id).await;
    let (b, _) = volunteer(&h, round.id).await;
    h.service
        .set_capacity_config(round.id, 3, Some(4), None)
        .await
        .expect("config set");

    // Two volunteers holding two offers each exhausts the override.
    for volunteer_id in [a, a, b, b] {
        let order = guest_order(&h).await;
        h.service
            .claim_order(order.id, volunteer_id, round.id)
            .await
            .expect("claimed");
    }
    assert_eq!(
        h.service
            .round_remaining_capacity(round.id)
            .await
            .expect("capacity"),
        0
    );

    let order = guest_order(&h).await;
    let err = h
        .service
        .claim_order(order.id, a, round.id)
        .await
        .expect_err("round is full");
    assert!(err.is_capacity_exceeded(), "got {err}");
    assert_eq!(
        h.service.order(order.id).await.expect("order").status,
        OrderStatus::Pending
    );
}

#[tokio::test]
async fn load_spreads_across_volunteers_lowest_id_first() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    let (a, _) = volunteer(&h, round.id).await;
    let (b, _) = volunteer(&h, round.id).await;
    let low = a.min(b);
    let high = a.max(b);

    guest_order(&h).await;
    guest_order(&h).await;
    guest_order(&h).await;

    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 3);

    let assignments = h
        .service
        .round_assignments(round.id)
        .await
        .expect("assignments");
    let held_by = |id| {
        assignments
            .iter()
            .filter(|x| x.volunteer_id == id)
            .count()
    };
    // Ties go to the lowest user id, so with three orders the lower id
    // holds two and the higher one.
    assert_eq!(held_by(low), 2);
    assert_eq!(held_by(high), 1);
}

#[tokio::test]
async fn rounds_without_confirmed_volunteers_are_skipped() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    guest_order(&h).await;

    let stats = run_pass(&h).await;
    assert_eq!(stats.rounds_processed, 1);
    assert_eq!(stats.orders_assigned, 0);

    // The order is untouched and a later pass picks it up.
    volunteer(&h, round.id).await;
    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 1);
}

#[tokio::test]
async fn cancelled_rounds_receive_no_orders() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    volunteer(&h, round.id).await;
    h.service.cancel_round(round.id).await.expect("cancelled");
    guest_order(&h).await;

    let stats = run_pass(&h).await;
    assert_eq!(stats.rounds_processed, 0);
    assert_eq!(stats.orders_assigned, 0);
}

#[tokio::test]
async fn orders_with_active_assignments_are_not_reallocated() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    let (volunteer_id, _) = volunteer(&h, round.id).await;
    let order = guest_order(&h).await;

    let assignment = h
        .service
        .claim_order(order.id, volunteer_id, round.id)
        .await
        .expect("claimed interactively");

    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 0);

    let assignments = h
        .service
        .round_assignments(round.id)
        .await
        .expect("assignments");
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].id, assignment.id);
    assert_eq!(assignments[0].status, AssignmentStatus::PendingAccept);
}

mod cancellation {
    //! Cooperative shutdown must stop a pass between orders, not just
    //! between rounds or pages.

    use std::collections::BTreeMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use rounds_dispatch::capacity::CapacityPolicy;
    use rounds_dispatch::domain::{
        Assignment, AssignmentStatus, CapacityConfig, NewOrder, NewRound, Order, OrderEffect,
        OrderLine, Round, RoundStatus, Signup, SignupRole, SignupStatus,
    };
    use rounds_dispatch::error::DispatchResult;
    use rounds_dispatch::scheduler::AllocationPass;
    use rounds_dispatch::store::memory::MemoryStore;
    use rounds_dispatch::store::DispatchStore;
    use rounds_id::{AssignmentId, OrderId, RoundId, SignupId, UserId};
    use tokio::sync::watch;

    /// Flips the shutdown flag the moment the first assignment
    /// commits, the way a deployment lands mid-pass.
    struct ShutdownOnFirstAssign {
        inner: MemoryStore,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl DispatchStore for ShutdownOnFirstAssign {
        async fn rate_limit_counts(
            &self,
            requester_id: Option<UserId>,
            client_ip: &str,
            window_start: DateTime<Utc>,
        ) -> DispatchResult<(i64, i64)> {
            self.inner
                .rate_limit_counts(requester_id, client_ip, window_start)
                .await
        }

        async fn admit_and_insert_order(
            &self,
            order: Order,
            window_start: DateTime<Utc>,
            ceiling: i64,
            window_secs: i64,
        ) -> DispatchResult<Order> {
            self.inner
                .admit_and_insert_order(order, window_start, ceiling, window_secs)
                .await
        }

        async fn delete_rate_limit_records_before(
            &self,
            horizon: DateTime<Utc>,
        ) -> DispatchResult<u64> {
            self.inner.delete_rate_limit_records_before(horizon).await
        }

        async fn order(&self, id: OrderId) -> DispatchResult<Order> {
            self.inner.order(id).await
        }

        async fn pending_orders(&self, limit: i64, offset: i64) -> DispatchResult<Vec<Order>> {
            self.inner.pending_orders(limit, offset).await
        }

        async fn insert_round(&self, round: Round) -> DispatchResult<Round> {
            self.inner.insert_round(round).await
        }

        async fn round(&self, id: RoundId) -> DispatchResult<Round> {
            self.inner.round(id).await
        }

        async fn rounds_with_status(&self, status: RoundStatus) -> DispatchResult<Vec<Round>> {
            self.inner.rounds_with_status(status).await
        }

        async fn set_round_status(
            &self,
            id: RoundId,
            status: RoundStatus,
            now: DateTime<Utc>,
        ) -> DispatchResult<()> {
            self.inner.set_round_status(id, status, now).await
        }

        async fn capacity_config(
            &self,
            round_id: RoundId,
        ) -> DispatchResult<Option<CapacityConfig>> {
            self.inner.capacity_config(round_id).await
        }

        async fn upsert_capacity_config(&self, config: CapacityConfig) -> DispatchResult<()> {
            self.inner.upsert_capacity_config(config).await
        }

        async fn insert_signup(
            &self,
            round_id: RoundId,
            user_id: UserId,
            role: SignupRole,
            now: DateTime<Utc>,
        ) -> DispatchResult<Signup> {
            self.inner.insert_signup(round_id, user_id, role, now).await
        }

        async fn signup(&self, id: SignupId) -> DispatchResult<Signup> {
            self.inner.signup(id).await
        }

        async fn round_signups(&self, round_id: RoundId) -> DispatchResult<Vec<Signup>> {
            self.inner.round_signups(round_id).await
        }

        async fn count_confirmed_volunteers(&self, round_id: RoundId) -> DispatchResult<i64> {
            self.inner.count_confirmed_volunteers(round_id).await
        }

        async fn apply_signup_statuses(
            &self,
            updates: &[(SignupId, SignupStatus)],
            now: DateTime<Utc>,
        ) -> DispatchResult<()> {
            self.inner.apply_signup_statuses(updates, now).await
        }

        async fn assignment(&self, id: AssignmentId) -> DispatchResult<Assignment> {
            self.inner.assignment(id).await
        }

        async fn round_assignments(&self, round_id: RoundId) -> DispatchResult<Vec<Assignment>> {
            self.inner.round_assignments(round_id).await
        }

        async fn count_reserving_round_assignments(
            &self,
            round_id: RoundId,
        ) -> DispatchResult<i64> {
            self.inner.count_reserving_round_assignments(round_id).await
        }

        async fn count_reserving_volunteer_assignments(
            &self,
            round_id: RoundId,
            volunteer_id: UserId,
        ) -> DispatchResult<i64> {
            self.inner
                .count_reserving_volunteer_assignments(round_id, volunteer_id)
                .await
        }

        async fn reserving_counts_by_volunteer(
            &self,
            round_id: RoundId,
        ) -> DispatchResult<BTreeMap<UserId, i64>> {
            self.inner.reserving_counts_by_volunteer(round_id).await
        }

        async fn create_assignment_locked(
            &self,
            order_id: OrderId,
            volunteer_id: UserId,
            round_id: RoundId,
            policy: CapacityPolicy,
            now: DateTime<Utc>,
        ) -> DispatchResult<Assignment> {
            let created = self
                .inner
                .create_assignment_locked(order_id, volunteer_id, round_id, policy, now)
                .await?;
            let _ = self.shutdown.send(true);
            Ok(created)
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
            self.inner
                .transition_assignment(id, expected_version, expected_status, target, effect, now)
                .await
        }
    }

    #[tokio::test]
    async fn shutdown_stops_a_pass_between_orders() {
        let now = Utc::now();
        let inner = MemoryStore::new();

        let round = NewRound {
            title: "Tuesday delivery round".to_string(),
            starts_at: now + Duration::hours(1),
            ends_at: now + Duration::hours(4),
            location: "Community center".to_string(),
            max_participants: 5,
        }
        .into_round(now);
        inner.insert_round(round.clone()).await.expect("round");
        let signup = inner
            .insert_signup(round.id, UserId::new(), SignupRole::Volunteer, now)
            .await
            .expect("signup");
        inner
            .apply_signup_statuses(&[(signup.id, SignupStatus::Confirmed)], now)
            .await
            .expect("confirmed");
        for offset in 0..3 {
            let order = NewOrder {
                requester_id: None,
                client_ip: format!("192.0.2.{offset}"),
                lines: vec![OrderLine {
                    item: "meal kit".to_string(),
                    quantity: 1,
                }],
                address: "12 Elm St".to_string(),
            }
            .into_order(now + Duration::seconds(offset));
            inner
                .admit_and_insert_order(order, now - Duration::minutes(5), 100, 300)
                .await
                .expect("order");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store: Arc<ShutdownOnFirstAssign> = Arc::new(ShutdownOnFirstAssign {
            inner,
            shutdown: shutdown_tx,
        });

        // All three orders fit in one page and one volunteer could take
        // them all; the flag raised by the first commit must stop the
        // pass before the second.
        let pass = AllocationPass::new(store.clone(), 50);
        let stats = pass.run(&shutdown_rx).await.expect("pass runs");
        assert_eq!(stats.orders_assigned, 1);

        let still_pending = store.pending_orders(50, 0).await.expect("pending");
        assert_eq!(still_pending.len(), 2);
    }
}

#[tokio::test]
async fn completed_work_frees_volunteer_capacity() {
    let h = harness();
    let round = scheduled_round(&h, 5).await;
    volunteer(&h, round.id).await;

    for _ in 0..3 {
        guest_order(&h).await;
    }
    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 3);

    // Completing one assignment releases a reserved slot.
    let assignment = h
        .service
        .round_assignments(round.id)
        .await
        .expect("assignments")
        .into_iter()
        .next()
        .expect("at least one");
    let assignment = h
        .service
        .accept_assignment(assignment.id, assignment.version)
        .await
        .expect("accepted");
    let assignment = h
        .service
        .start_assignment(assignment.id, assignment.version)
        .await
        .expect("started");
    h.service
        .complete_assignment(assignment.id, assignment.version)
        .await
        .expect("completed");

    guest_order(&h).await;
    let stats = run_pass(&h).await;
    assert_eq!(stats.orders_assigned, 1);
}
