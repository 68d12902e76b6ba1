//! Round signups and roles.

use chrono::{DateTime, Utc};
use rounds_id::{RoundId, SignupId, UserId};
use serde::{Deserialize, Serialize};

use super::ParseStatusError;

/// Role a user registers for. Volunteers compete for
/// `max_participants` slots; clinician and team lead are single-slot
/// roles outside the volunteer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignupRole {
    Volunteer,
    Clinician,
    TeamLead,
}

impl SignupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Volunteer => "volunteer",
            Self::Clinician => "clinician",
            Self::TeamLead => "team_lead",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "volunteer" => Ok(Self::Volunteer),
            "clinician" => Ok(Self::Clinician),
            "team_lead" => Ok(Self::TeamLead),
            _ => Err(ParseStatusError::new("signup role", s)),
        }
    }
}

impl std::fmt::Display for SignupRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a signup as decided by the lottery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignupStatus {
    Pending,
    Confirmed,
    Waitlisted,
    Canceled,
}

impl SignupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Waitlisted => "waitlisted",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "waitlisted" => Ok(Self::Waitlisted),
            "canceled" => Ok(Self::Canceled),
            _ => Err(ParseStatusError::new("signup status", s)),
        }
    }
}

impl std::fmt::Display for SignupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's registration for a round. Unique per (round, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signup {
    pub id: SignupId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub role: SignupRole,
    pub status: SignupStatus,
    /// Tie-break ordinal assigned once at signup time, totally ordered
    /// within the round, never reused or reassigned.
    pub lottery_number: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
