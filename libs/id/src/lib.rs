//! # rounds-id
//!
//! Typed entity identifiers for the rounds dispatch engine.
//!
//! Every persisted entity carries a ULID-backed id with a short type
//! prefix, e.g. `ord_01HV4Z2WQXKJNM8GPQY6VBKC3D` for an order. The
//! prefix makes ids self-describing in logs and prevents an order id
//! from being handed to an API that expects a round id.
//!
//! Properties:
//!
//! - Strict parsing: `{prefix}_{ulid}`, nothing else accepted
//! - Round-trip stable: parse → format → parse is the identity
//! - Time-ordered: ULIDs sort by creation time, which the order queue
//!   relies on as a tie-break alongside explicit timestamps

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export for consumers that need raw ULID operations.
pub use ulid::Ulid;
