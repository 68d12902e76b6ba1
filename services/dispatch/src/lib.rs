//! Delivery dispatch engine: orders, rounds, signups, assignments.
//!
//! Volunteers sign up for scheduled delivery rounds; a lottery
//! confirms rosters deterministically; pending orders are matched to
//! confirmed volunteers by a periodic allocation pass under round and
//! per-volunteer capacity limits; assignment lifecycles drive order
//! state. Order submission is rate limited per requester and per IP.
//!
//! [`service::DispatchService`] is the single entry point; everything
//! below it is wired over the [`store::DispatchStore`] trait.

pub mod assignment;
pub mod capacity;
pub mod config;
pub mod domain;
pub mod error;
pub mod lottery;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod service;
pub mod store;
