//! Assignments and their transition table.

use chrono::{DateTime, Utc};
use rounds_id::{AssignmentId, OrderId, RoundId, UserId};
use serde::{Deserialize, Serialize};

use super::ParseStatusError;

/// Lifecycle status of an assignment.
///
/// Transitions only move forward:
///
/// ```text
/// (none) --create--> PendingAccept
/// PendingAccept --accept--> Accepted
/// Accepted --start--> InProgress
/// InProgress --complete--> Completed
/// PendingAccept | Accepted | InProgress --cancel--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    PendingAccept,
    Accepted,
    InProgress,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingAccept => "pending_accept",
            Self::Accepted => "accepted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "pending_accept" => Ok(Self::PendingAccept),
            "accepted" => Ok(Self::Accepted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseStatusError::new("assignment status", s)),
        }
    }

    /// `Completed` and `Cancelled` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// An active assignment reserves capacity and blocks other
    /// assignments for the same order. Everything except `Cancelled`
    /// counts: `PendingAccept` is an in-flight offer not yet rejected,
    /// and `Completed` work consumed a slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// `PendingAccept`, `Accepted`, and `InProgress` reserve round and
    /// volunteer capacity.
    pub fn reserves_capacity(&self) -> bool {
        matches!(self, Self::PendingAccept | Self::Accepted | Self::InProgress)
    }

    /// Exhaustive transition table. Cancellation is legal from any
    /// non-terminal state; nothing ever regresses.
    pub fn can_transition_to(&self, target: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, target),
            (PendingAccept, Accepted)
                | (PendingAccept, Cancelled)
                | (Accepted, InProgress)
                | (Accepted, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }
}

impl std::fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The binding of one order to one volunteer within one round.
///
/// `version` increments on every successful transition; callers must
/// present the version they last observed (optimistic concurrency).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub order_id: OrderId,
    pub volunteer_id: UserId,
    pub round_id: RoundId,
    pub status: AssignmentStatus,
    pub version: i64,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    /// A fresh `PendingAccept` assignment at version 0.
    pub fn offered(
        order_id: OrderId,
        volunteer_id: UserId,
        round_id: RoundId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AssignmentId::new(),
            order_id,
            volunteer_id,
            round_id,
            status: AssignmentStatus::PendingAccept,
            version: 0,
            accepted_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a successful assignment transition does to the bound order,
/// applied in the same transaction as the transition itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEffect {
    /// Order untouched (accept keeps it `Assigned`).
    None,
    /// Order moves to `InProgress`.
    Started,
    /// Order moves to `Completed`.
    Completed,
    /// Order returns to `Pending` with the round unbound, so the next
    /// allocation pass can pick it up again.
    Requeued,
}
