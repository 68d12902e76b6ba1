//! The dispatch service facade.
//!
//! One cheaply-cloneable handle owning the store and every engine
//! built on it. Input validation lives here, before any write; the
//! engines below assume validated input and enforce only concurrency
//! and state-machine invariants.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, SignupId, UserId};
use tokio::sync::watch;
use tracing::info;

use crate::assignment::AssignmentEngine;
use crate::capacity::CapacityCalculator;
use crate::domain::{
    Assignment, CapacityConfig, NewOrder, NewRound, Order, Round, RoundStatus, Signup, SignupRole,
    SignupStatus,
};
use crate::error::{DispatchError, DispatchResult};
use crate::lottery::{Lottery, LotteryOutcome};
use crate::queue::OrderQueue;
use crate::ratelimit::{Clock, RateLimitConfig, RateLimiter, SweepWorker, SystemClock};
use crate::scheduler::{AllocationPass, PassOutcome, PassRunner, SchedulerWorker};
use crate::store::DispatchStore;

/// Service-level tunables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub rate_limit: RateLimitConfig,
    pub queue_page_size: i64,
    pub scheduler_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            queue_page_size: crate::queue::DEFAULT_PAGE_SIZE,
            scheduler_interval: Duration::from_secs(3600),
        }
    }
}

struct Inner {
    store: Arc<dyn DispatchStore>,
    limiter: RateLimiter,
    engine: AssignmentEngine,
    lottery: Lottery,
    calculator: CapacityCalculator,
    queue: OrderQueue,
    runner: Arc<PassRunner>,
    clock: Arc<dyn Clock>,
    config: ServiceConfig,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

/// Cloneable handle to the dispatch engine.
#[derive(Clone)]
pub struct DispatchService {
    inner: Arc<Inner>,
}

impl DispatchService {
    pub fn new(store: Arc<dyn DispatchStore>, config: ServiceConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Construct with an injected time source.
    pub fn with_clock(
        store: Arc<dyn DispatchStore>,
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let limiter = RateLimiter::new(store.clone(), config.rate_limit.clone(), clock.clone());
        let pass = AllocationPass::new(store.clone(), config.queue_page_size);
        Self {
            inner: Arc::new(Inner {
                limiter,
                engine: AssignmentEngine::new(store.clone()),
                lottery: Lottery::new(store.clone()),
                calculator: CapacityCalculator::new(store.clone()),
                queue: OrderQueue::new(store.clone(), config.queue_page_size),
                runner: Arc::new(PassRunner::new(pass)),
                store,
                clock,
                config,
                cancel_tx,
                cancel_rx,
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Validate, rate-limit, and persist a new order.
    pub async fn submit_order(&self, input: NewOrder) -> DispatchResult<Order> {
        if input.client_ip.trim().is_empty() {
            return Err(DispatchError::Validation(
                "client ip must not be empty".to_string(),
            ));
        }
        if input.address.trim().is_empty() {
            return Err(DispatchError::Validation(
                "delivery address must not be empty".to_string(),
            ));
        }
        if input.lines.is_empty() {
            return Err(DispatchError::Validation(
                "order must contain at least one line".to_string(),
            ));
        }
        for line in &input.lines {
            if line.item.trim().is_empty() {
                return Err(DispatchError::Validation(
                    "order line item must not be empty".to_string(),
                ));
            }
            if line.quantity <= 0 {
                return Err(DispatchError::Validation(format!(
                    "order line quantity must be positive, got {}",
                    line.quantity
                )));
            }
        }

        let order = input.into_order(self.now());
        let order = self.inner.limiter.admit_and_insert(order).await?;
        info!(order_id = %order.id, guest = order.requester_id.is_none(), "Order submitted");
        Ok(order)
    }

    /// Pure admission check: would a submission from this identity be
    /// admitted right now? Records nothing.
    pub async fn admit_order(
        &self,
        requester_id: Option<UserId>,
        client_ip: &str,
    ) -> DispatchResult<()> {
        self.inner.limiter.check(requester_id, client_ip).await
    }

    pub async fn order(&self, id: OrderId) -> DispatchResult<Order> {
        self.inner.store.order(id).await
    }

    /// One page of the pending-order queue.
    pub async fn pending_orders(&self, offset: i64) -> DispatchResult<Vec<Order>> {
        self.inner.queue.next_pending(offset).await
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    pub async fn create_round(&self, input: NewRound) -> DispatchResult<Round> {
        if input.title.trim().is_empty() {
            return Err(DispatchError::Validation(
                "round title must not be empty".to_string(),
            ));
        }
        if input.ends_at <= input.starts_at {
            return Err(DispatchError::Validation(
                "round must end after it starts".to_string(),
            ));
        }
        if input.max_participants <= 0 {
            return Err(DispatchError::Validation(format!(
                "max participants must be positive, got {}",
                input.max_participants
            )));
        }

        let round = self.inner.store.insert_round(input.into_round(self.now())).await?;
        info!(round_id = %round.id, title = %round.title, "Round created");
        Ok(round)
    }

    pub async fn round(&self, id: RoundId) -> DispatchResult<Round> {
        self.inner.store.round(id).await
    }

    /// Cancel a round: the round stops accepting work, its active
    /// assignments are cancelled (requeueing their orders), and its
    /// signups are released.
    ///
    /// The cleanup is resumable: the status flips first, and
    /// re-invoking on an already-cancelled round releases whatever is
    /// still held, so a failure partway through never strands the
    /// round half-cancelled.
    pub async fn cancel_round(&self, id: RoundId) -> DispatchResult<Round> {
        let round = self.inner.store.round(id).await?;
        if round.status == RoundStatus::Completed {
            return Err(DispatchError::conflict(format!(
                "round {id} is completed and cannot be cancelled"
            )));
        }

        let now = self.now();
        if round.status == RoundStatus::Scheduled {
            self.inner
                .store
                .set_round_status(id, RoundStatus::Cancelled, now)
                .await?;
        }

        let mut cancelled_assignments = 0usize;
        for assignment in self.inner.store.round_assignments(id).await? {
            if assignment.status.is_terminal() {
                continue;
            }
            match self
                .inner
                .engine
                .cancel(assignment.id, assignment.version, now)
                .await
            {
                Ok(_) => cancelled_assignments += 1,
                // A volunteer transitioned the assignment between our
                // read and the cancel; retry against the current row.
                Err(e) if e.is_conflict() => {
                    let current = self.inner.store.assignment(assignment.id).await?;
                    if current.status.is_terminal() {
                        continue;
                    }
                    self.inner
                        .engine
                        .cancel(current.id, current.version, now)
                        .await?;
                    cancelled_assignments += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let releases: Vec<(SignupId, SignupStatus)> = self
            .inner
            .store
            .round_signups(id)
            .await?
            .into_iter()
            .filter(|s| s.status != SignupStatus::Canceled)
            .map(|s| (s.id, SignupStatus::Canceled))
            .collect();
        if !releases.is_empty() {
            self.inner.store.apply_signup_statuses(&releases, now).await?;
        }

        info!(
            round_id = %id,
            cancelled_assignments,
            released_signups = releases.len(),
            "Round cancelled"
        );
        self.inner.store.round(id).await
    }

    // ------------------------------------------------------------------
    // Signups and lottery
    // ------------------------------------------------------------------

    /// Sign a user up for a round and re-run confirmation. Returns the
    /// signup with its post-lottery status.
    pub async fn submit_signup(
        &self,
        round_id: RoundId,
        user_id: UserId,
        role: SignupRole,
    ) -> DispatchResult<Signup> {
        let round = self.inner.store.round(round_id).await?;
        if round.status != RoundStatus::Scheduled {
            return Err(DispatchError::conflict(format!(
                "round {round_id} is {} and not accepting signups",
                round.status
            )));
        }

        let now = self.now();
        let signup = self
            .inner
            .store
            .insert_signup(round_id, user_id, role, now)
            .await?;
        self.inner.lottery.confirm(round_id, now).await?;
        self.inner.store.signup(signup.id).await
    }

    /// Cancel a signup and re-run confirmation, which may promote a
    /// waitlisted participant. Idempotent.
    pub async fn cancel_signup(&self, id: SignupId) -> DispatchResult<Signup> {
        let signup = self.inner.store.signup(id).await?;
        if signup.status == SignupStatus::Canceled {
            return Ok(signup);
        }

        let now = self.now();
        self.inner
            .store
            .apply_signup_statuses(&[(id, SignupStatus::Canceled)], now)
            .await?;
        self.inner.lottery.confirm(signup.round_id, now).await?;
        self.inner.store.signup(id).await
    }

    /// Re-run confirmation for a round without changing any signup.
    pub async fn confirm_signups(&self, round_id: RoundId) -> DispatchResult<LotteryOutcome> {
        self.inner.lottery.confirm(round_id, self.now()).await
    }

    pub async fn signup(&self, id: SignupId) -> DispatchResult<Signup> {
        self.inner.store.signup(id).await
    }

    pub async fn round_signups(&self, round_id: RoundId) -> DispatchResult<Vec<Signup>> {
        self.inner.store.round_signups(round_id).await
    }

    // ------------------------------------------------------------------
    // Assignments
    // ------------------------------------------------------------------

    /// Offer an order to a volunteer, outside of a scheduler pass.
    pub async fn claim_order(
        &self,
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
    ) -> DispatchResult<Assignment> {
        self.inner
            .engine
            .create(order_id, volunteer_id, round_id, self.now())
            .await
    }

    pub async fn accept_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
    ) -> DispatchResult<Assignment> {
        self.inner.engine.accept(id, expected_version, self.now()).await
    }

    pub async fn start_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
    ) -> DispatchResult<Assignment> {
        self.inner.engine.start(id, expected_version, self.now()).await
    }

    pub async fn complete_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
    ) -> DispatchResult<Assignment> {
        self.inner.engine.complete(id, expected_version, self.now()).await
    }

    pub async fn cancel_assignment(
        &self,
        id: AssignmentId,
        expected_version: i64,
    ) -> DispatchResult<Assignment> {
        self.inner.engine.cancel(id, expected_version, self.now()).await
    }

    pub async fn assignment(&self, id: AssignmentId) -> DispatchResult<Assignment> {
        self.inner.store.assignment(id).await
    }

    pub async fn round_assignments(&self, round_id: RoundId) -> DispatchResult<Vec<Assignment>> {
        self.inner.store.round_assignments(round_id).await
    }

    // ------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------

    /// Create or update a round's capacity configuration.
    pub async fn set_capacity_config(
        &self,
        round_id: RoundId,
        max_orders_per_volunteer: i32,
        override_capacity: Option<i32>,
        updated_by: Option<UserId>,
    ) -> DispatchResult<CapacityConfig> {
        if max_orders_per_volunteer <= 0 {
            return Err(DispatchError::Validation(format!(
                "max orders per volunteer must be positive, got {max_orders_per_volunteer}"
            )));
        }
        if let Some(cap) = override_capacity {
            if cap < 0 {
                return Err(DispatchError::Validation(format!(
                    "capacity override must not be negative, got {cap}"
                )));
            }
        }
        // Reject configs for unknown rounds up front.
        self.inner.store.round(round_id).await?;

        let now = self.now();
        let created_at = self
            .inner
            .store
            .capacity_config(round_id)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let config = CapacityConfig {
            round_id,
            max_orders_per_volunteer,
            override_capacity,
            updated_by,
            created_at,
            updated_at: now,
        };
        self.inner.store.upsert_capacity_config(config.clone()).await?;
        info!(
            round_id = %round_id,
            max_orders_per_volunteer,
            override_capacity = ?override_capacity,
            "Capacity config updated"
        );
        Ok(config)
    }

    pub async fn capacity_config(&self, round_id: RoundId) -> DispatchResult<Option<CapacityConfig>> {
        self.inner.store.capacity_config(round_id).await
    }

    pub async fn round_remaining_capacity(&self, round_id: RoundId) -> DispatchResult<i64> {
        self.inner.calculator.round_remaining_capacity(round_id).await
    }

    pub async fn volunteer_remaining_capacity(
        &self,
        round_id: RoundId,
        volunteer_id: UserId,
    ) -> DispatchResult<i64> {
        self.inner
            .calculator
            .volunteer_remaining_capacity(round_id, volunteer_id)
            .await
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// Trigger an allocation pass now. A no-op returning
    /// [`PassOutcome::AlreadyRunning`] when a pass is in flight.
    pub async fn run_allocation_pass(&self) -> DispatchResult<PassOutcome> {
        self.inner.runner.try_run(&self.inner.cancel_rx).await
    }

    /// Build the periodic scheduler worker sharing this service's pass
    /// runner, so timer and on-demand triggers serialize together.
    pub fn scheduler_worker(&self) -> SchedulerWorker {
        SchedulerWorker::new(
            self.inner.runner.clone(),
            self.inner.config.scheduler_interval,
        )
    }

    /// Build the rate-limit sweep worker.
    pub fn sweep_worker(&self) -> SweepWorker {
        SweepWorker::new(
            self.inner.store.clone(),
            self.inner.config.rate_limit.clone(),
            self.inner.clock.clone(),
        )
    }

    /// Signal shutdown to an in-flight allocation pass.
    pub fn request_shutdown(&self) {
        let _ = self.inner.cancel_tx.send(true);
    }
}
