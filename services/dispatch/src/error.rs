//! Error taxonomy for the dispatch engine.
//!
//! Every fallible operation in this crate returns [`DispatchError`].
//! The variants map one-to-one onto the outcomes a caller has to
//! distinguish: reject before write (`Validation`), re-read and retry
//! (`Conflict`), back off (`RateLimitExceeded`), try another target
//! (`CapacityExceeded`), or give up and let the next tick/retry recover
//! (`Database`).

use std::fmt;

use rounds_id::{RoundId, UserId};

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced by the dispatch engine.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Input rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Concurrent modification or uniqueness violation. The caller
    /// should re-read and retry; the engine never retries on its own.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Too many order-creation attempts inside the sliding window.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(RateLimitDetail),

    /// The round or volunteer has no remaining slots.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(CapacityDetail),

    /// Storage failure. Aborts the current pass or transition; the
    /// next timer tick or client retry is the recovery path.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DispatchError {
    /// Shorthand for a [`DispatchError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for a [`DispatchError::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Returns true for conflicts (stale version, duplicate active
    /// assignment, duplicate signup).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true when a round or volunteer is out of slots.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded(_))
    }
}

/// Which identity tripped the rate limit, and by how much.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDetail {
    /// `"requester"` or `"ip"`.
    pub scope: &'static str,
    /// Attempts already recorded inside the window.
    pub count: i64,
    /// Configured ceiling.
    pub ceiling: i64,
    /// Window length in seconds.
    pub window_secs: i64,
}

impl fmt::Display for RateLimitDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} made {} attempts in the last {}s (ceiling {})",
            self.scope, self.count, self.window_secs, self.ceiling
        )
    }
}

/// Which capacity dimension is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityDetail {
    pub round_id: RoundId,
    /// Set when the volunteer-level cap tripped rather than the
    /// round-level one.
    pub volunteer_id: Option<UserId>,
    pub capacity: i64,
    pub in_use: i64,
}

impl fmt::Display for CapacityDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.volunteer_id {
            Some(volunteer) => write!(
                f,
                "volunteer {} in round {} holds {} of {} slots",
                volunteer, self.round_id, self.in_use, self.capacity
            ),
            None => write!(
                f,
                "round {} holds {} of {} slots",
                self.round_id, self.in_use, self.capacity
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_detail_display() {
        let round_id = RoundId::new();
        let detail = CapacityDetail {
            round_id,
            volunteer_id: None,
            capacity: 6,
            in_use: 6,
        };
        let rendered = detail.to_string();
        assert!(rendered.contains("6 of 6"));
        assert!(rendered.contains(&round_id.to_string()));
    }

    #[test]
    fn rate_limit_detail_display() {
        let detail = RateLimitDetail {
            scope: "ip",
            count: 3,
            ceiling: 3,
            window_secs: 300,
        };
        assert_eq!(detail.to_string(), "ip made 3 attempts in the last 300s (ceiling 3)");
    }
}
