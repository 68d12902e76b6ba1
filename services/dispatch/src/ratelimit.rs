//! Sliding-window rate limiting for order submission.
//!
//! Every admitted submission appends an attempt record keyed by
//! requester id (when authenticated) and client IP. Admission counts
//! records inside the trailing window against a fixed ceiling,
//! independently per identity: an authenticated requester is limited
//! by their id and their IP, a guest by IP alone. Old records are
//! pruned by [`SweepWorker`] on an interval.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument};

use rounds_id::UserId;

use crate::domain::Order;
use crate::error::{DispatchError, DispatchResult, RateLimitDetail};
use crate::store::DispatchStore;

pub const DEFAULT_WINDOW_SECS: i64 = 300;
pub const DEFAULT_CEILING: i64 = 3;
pub const DEFAULT_RETENTION_HOURS: i64 = 24;
pub const DEFAULT_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// Rate limiting configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Trailing window inside which attempts are counted.
    pub window: Duration,

    /// Maximum attempts per identity inside the window.
    pub ceiling: i64,

    /// How long attempt records are retained before the sweeper
    /// deletes them.
    pub retention: Duration,

    /// Interval between sweep passes.
    pub sweep_interval: StdDuration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::seconds(DEFAULT_WINDOW_SECS),
            ceiling: DEFAULT_CEILING,
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Time source, injectable so window expiry is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Sliding-window limiter over the attempt log.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn DispatchStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.window
    }

    /// Pure admission check: would a submission from this identity be
    /// admitted right now? Counts only, records nothing.
    pub async fn check(&self, requester_id: Option<UserId>, client_ip: &str) -> DispatchResult<()> {
        let now = self.clock.now();
        let (requester_count, ip_count) = self
            .store
            .rate_limit_counts(requester_id, client_ip, self.window_start(now))
            .await?;

        if requester_count >= self.config.ceiling {
            return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                scope: "requester",
                count: requester_count,
                ceiling: self.config.ceiling,
                window_secs: self.config.window.num_seconds(),
            }));
        }
        if ip_count >= self.config.ceiling {
            return Err(DispatchError::RateLimitExceeded(RateLimitDetail {
                scope: "ip",
                count: ip_count,
                ceiling: self.config.ceiling,
                window_secs: self.config.window.num_seconds(),
            }));
        }
        Ok(())
    }

    /// Admission plus order creation as one atomic store operation, so
    /// concurrent submissions from one identity count each other.
    pub async fn admit_and_insert(&self, order: Order) -> DispatchResult<Order> {
        let now = self.clock.now();
        self.store
            .admit_and_insert_order(
                order,
                self.window_start(now),
                self.config.ceiling,
                self.config.window.num_seconds(),
            )
            .await
    }
}

/// Background pruner for expired attempt records.
pub struct SweepWorker {
    store: Arc<dyn DispatchStore>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl SweepWorker {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Run the sweep loop until shutdown is signalled.
    #[instrument(skip(self, shutdown), name = "sweep_worker")]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            retention_hours = self.config.retention.num_hours(),
            "Rate-limit sweep worker started"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!(error = %e, "Rate-limit sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Rate-limit sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Delete attempt records older than the retention horizon.
    pub async fn sweep_once(&self) -> DispatchResult<u64> {
        let horizon = self.clock.now() - self.config.retention;
        let removed = self.store.delete_rate_limit_records_before(horizon).await?;
        if removed > 0 {
            info!(removed, "Pruned expired rate-limit records");
        }
        Ok(removed)
    }
}
