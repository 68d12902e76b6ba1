//! Rounds and per-round capacity configuration.

use chrono::{DateTime, Utc};
use rounds_id::{RoundId, UserId};
use serde::{Deserialize, Serialize};

use super::ParseStatusError;

/// Default per-volunteer order cap when no config row exists.
pub const DEFAULT_MAX_ORDERS_PER_VOLUNTEER: i32 = 3;

/// Lifecycle status of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            _ => Err(ParseStatusError::new("round status", s)),
        }
    }
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled service session with a fixed time window and roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: String,
    /// Cap on CONFIRMED volunteer signups; clinician and team-lead
    /// slots are separate and not counted against this.
    pub max_participants: i32,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for round creation.
#[derive(Debug, Clone)]
pub struct NewRound {
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: String,
    pub max_participants: i32,
}

impl NewRound {
    pub fn into_round(self, now: DateTime<Utc>) -> Round {
        Round {
            id: RoundId::new(),
            title: self.title,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            location: self.location,
            max_participants: self.max_participants,
            status: RoundStatus::Scheduled,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Administrator-set capacity knobs for one round.
///
/// When `override_capacity` is set it supersedes the derived
/// `max_orders_per_volunteer × confirmed volunteers` round capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    pub round_id: RoundId,
    pub max_orders_per_volunteer: i32,
    pub override_capacity: Option<i32>,
    /// Audit: who last changed the config, if known.
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CapacityConfig {
    /// The implicit config used when no row exists for the round.
    pub fn default_for(round_id: RoundId, now: DateTime<Utc>) -> Self {
        Self {
            round_id,
            max_orders_per_volunteer: DEFAULT_MAX_ORDERS_PER_VOLUNTEER,
            override_capacity: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            RoundStatus::Scheduled,
            RoundStatus::Cancelled,
            RoundStatus::Completed,
        ] {
            assert_eq!(RoundStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RoundStatus::parse("open").is_err());
    }

    #[test]
    fn default_config_uses_per_volunteer_cap() {
        let config = CapacityConfig::default_for(RoundId::new(), Utc::now());
        assert_eq!(config.max_orders_per_volunteer, 3);
        assert!(config.override_capacity.is_none());
    }
}
