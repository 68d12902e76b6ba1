//! Deterministic signup confirmation.
//!
//! Each signup receives a monotonically increasing lottery number at
//! insertion time, so confirmation order is fixed at signup time and
//! re-running confirmation after a cancellation promotes the next
//! number in line rather than reshuffling.
//!
//! Slot rules per round:
//! - Volunteers: the `max_participants` lowest lottery numbers are
//!   `Confirmed`, the rest `Waitlisted`.
//! - Clinician and team lead: one slot each. An already-confirmed
//!   holder keeps the slot; otherwise the lowest number wins it.
//! - `Canceled` signups never hold or regain a slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rounds_id::{RoundId, SignupId};
use tracing::info;

use crate::domain::{Signup, SignupRole, SignupStatus};
use crate::error::DispatchResult;
use crate::store::DispatchStore;

/// Result of one confirmation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LotteryOutcome {
    pub confirmed: usize,
    pub waitlisted: usize,
}

/// Compute the status each non-canceled signup should hold, returning
/// only the signups whose status needs to change.
pub fn resolve(signups: &[Signup], max_participants: i32) -> Vec<(SignupId, SignupStatus)> {
    let mut updates = Vec::new();

    resolve_single_slot(signups, SignupRole::Clinician, &mut updates);
    resolve_single_slot(signups, SignupRole::TeamLead, &mut updates);

    let mut volunteers: Vec<&Signup> = signups
        .iter()
        .filter(|s| s.role == SignupRole::Volunteer && s.status != SignupStatus::Canceled)
        .collect();
    volunteers.sort_by_key(|s| s.lottery_number);

    let slots = usize::try_from(max_participants).unwrap_or(0);
    for (position, signup) in volunteers.iter().enumerate() {
        let target = if position < slots {
            SignupStatus::Confirmed
        } else {
            SignupStatus::Waitlisted
        };
        if signup.status != target {
            updates.push((signup.id, target));
        }
    }

    updates
}

fn resolve_single_slot(
    signups: &[Signup],
    role: SignupRole,
    updates: &mut Vec<(SignupId, SignupStatus)>,
) {
    let mut candidates: Vec<&Signup> = signups
        .iter()
        .filter(|s| s.role == role && s.status != SignupStatus::Canceled)
        .collect();
    // A confirmed holder keeps the slot across re-runs; ties broken by
    // lottery number.
    candidates.sort_by_key(|s| (s.status != SignupStatus::Confirmed, s.lottery_number));

    for (position, signup) in candidates.iter().enumerate() {
        let target = if position == 0 {
            SignupStatus::Confirmed
        } else {
            SignupStatus::Waitlisted
        };
        if signup.status != target {
            updates.push((signup.id, target));
        }
    }
}

/// Store-backed confirmation runner.
#[derive(Clone)]
pub struct Lottery {
    store: Arc<dyn DispatchStore>,
}

impl Lottery {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// Re-run confirmation for a round and persist any status changes.
    pub async fn confirm(&self, round_id: RoundId, now: DateTime<Utc>) -> DispatchResult<LotteryOutcome> {
        let round = self.store.round(round_id).await?;
        let signups = self.store.round_signups(round_id).await?;

        let updates = resolve(&signups, round.max_participants);
        if !updates.is_empty() {
            self.store.apply_signup_statuses(&updates, now).await?;
        }

        let outcome = LotteryOutcome {
            confirmed: updates
                .iter()
                .filter(|(_, s)| *s == SignupStatus::Confirmed)
                .count(),
            waitlisted: updates
                .iter()
                .filter(|(_, s)| *s == SignupStatus::Waitlisted)
                .count(),
        };
        if outcome.confirmed > 0 || outcome.waitlisted > 0 {
            info!(
                round_id = %round_id,
                confirmed = outcome.confirmed,
                waitlisted = outcome.waitlisted,
                "Signup confirmation applied"
            );
        }
        Ok(outcome)
    }
}
