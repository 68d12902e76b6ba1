//! Single-flight pass execution and the periodic scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{error, info, instrument};

use crate::error::DispatchResult;
use crate::scheduler::pass::{AllocationPass, PassStats};

/// Result of asking for a pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The pass ran to completion (or cancellation) with these stats.
    Completed(PassStats),
    /// Another pass was already in flight; nothing ran.
    AlreadyRunning,
}

/// Serializes pass execution: the timer and the on-demand trigger
/// share one runner, and a trigger that lands mid-pass is a no-op.
pub struct PassRunner {
    pass: AllocationPass,
    gate: Semaphore,
}

impl PassRunner {
    pub fn new(pass: AllocationPass) -> Self {
        Self {
            pass,
            gate: Semaphore::new(1),
        }
    }

    /// Run a pass unless one is already in flight.
    pub async fn try_run(&self, cancel: &watch::Receiver<bool>) -> DispatchResult<PassOutcome> {
        let Ok(_permit) = self.gate.try_acquire() else {
            return Ok(PassOutcome::AlreadyRunning);
        };
        let stats = self.pass.run(cancel).await?;
        Ok(PassOutcome::Completed(stats))
    }
}

/// Periodic allocation loop.
pub struct SchedulerWorker {
    runner: Arc<PassRunner>,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(runner: Arc<PassRunner>, interval: Duration) -> Self {
        Self { runner, interval }
    }

    /// Run passes on the configured interval until shutdown is
    /// signalled. The shutdown signal also cancels an in-flight pass
    /// at its next order or round boundary.
    #[instrument(skip(self, shutdown), name = "scheduler_worker")]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Scheduler worker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.runner.try_run(&shutdown).await {
                        Ok(PassOutcome::Completed(_)) => {}
                        Ok(PassOutcome::AlreadyRunning) => {
                            info!("Skipping tick, allocation pass already running");
                        }
                        Err(e) => {
                            error!(error = %e, "Allocation pass failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn second_trigger_is_rejected_while_pass_holds_the_gate() {
        let store = Arc::new(MemoryStore::new());
        let runner = PassRunner::new(AllocationPass::new(store, 10));
        let (_tx, cancel) = watch::channel(false);

        let permit = runner
            .gate
            .try_acquire()
            .expect("gate starts with one permit");
        let outcome = runner.try_run(&cancel).await.expect("no pass ran");
        assert_eq!(outcome, PassOutcome::AlreadyRunning);

        drop(permit);
        let outcome = runner.try_run(&cancel).await.expect("pass runs");
        assert!(matches!(outcome, PassOutcome::Completed(_)));
    }
}
