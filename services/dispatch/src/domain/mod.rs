//! Domain entities and their closed status enumerations.
//!
//! Statuses are tagged enums rather than open strings so the
//! assignment transition table can be checked exhaustively and illegal
//! states cannot be represented. Each enum carries a canonical
//! snake_case string form shared by serde and the database layer.

mod assignment;
mod order;
mod round;
mod signup;

pub use assignment::{Assignment, AssignmentStatus, OrderEffect};
pub use order::{NewOrder, Order, OrderLine, OrderStatus, RateLimitRecord};
pub use round::{CapacityConfig, NewRound, Round, RoundStatus, DEFAULT_MAX_ORDERS_PER_VOLUNTEER};
pub use signup::{Signup, SignupRole, SignupStatus};

/// A status or role column held a string this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

impl ParseStatusError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
