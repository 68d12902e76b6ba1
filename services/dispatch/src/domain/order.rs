//! Orders and the rate-limit attempt log.

use chrono::{DateTime, Utc};
use rounds_id::{OrderId, RoundId, UserId};
use serde::{Deserialize, Serialize};

use super::ParseStatusError;

/// Lifecycle status of an order.
///
/// `round_id` is `None` while the order is `Pending`; creating an
/// assignment binds the round and moves the order to `Assigned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseStatusError::new("order status", s)),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested item line on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item: String,
    pub quantity: i32,
}

/// A delivery request.
///
/// Never deleted; terminal states are `Completed` and `Cancelled`.
/// Mutated only by the assignment state machine and by
/// completion/cancellation propagation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// None for guest orders; rate limiting then falls back to IP only.
    pub requester_id: Option<UserId>,
    /// Client network identity as observed by the (external) API layer.
    pub client_ip: String,
    pub lines: Vec<OrderLine>,
    /// Free-text delivery address or geo description.
    pub address: String,
    pub status: OrderStatus,
    /// Bound once an assignment is created; None while `Pending`.
    pub round_id: Option<RoundId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for order creation, validated before any write.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub requester_id: Option<UserId>,
    pub client_ip: String,
    pub lines: Vec<OrderLine>,
    pub address: String,
}

impl NewOrder {
    /// Builds the persisted order with a fresh id and `Pending` status.
    pub fn into_order(self, now: DateTime<Utc>) -> Order {
        Order {
            id: OrderId::new(),
            requester_id: self.requester_id,
            client_ip: self.client_ip,
            lines: self.lines,
            address: self.address,
            status: OrderStatus::Pending,
            round_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row per order-creation attempt. Purely additive; trimmed by the
/// retention sweep, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub requester_id: Option<UserId>,
    pub client_ip: String,
    pub created_at: DateTime<Utc>,
}
