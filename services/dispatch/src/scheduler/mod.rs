//! Periodic allocation of pending orders to scheduled rounds.

mod pass;
mod worker;

pub use pass::{AllocationPass, PassStats};
pub use worker::{PassOutcome, PassRunner, SchedulerWorker};
