//! Shared test harness: the service wired over the in-memory store
//! with a manually advanced clock.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rounds_dispatch::domain::{NewOrder, NewRound, Order, OrderLine, Round, Signup, SignupRole};
use rounds_dispatch::ratelimit::{Clock, ManualClock};
use rounds_dispatch::service::{DispatchService, ServiceConfig};
use rounds_dispatch::store::memory::MemoryStore;
use rounds_id::{RoundId, UserId};

pub struct Harness {
    pub service: DispatchService,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    harness_with(ServiceConfig::default())
}

pub fn harness_with(config: ServiceConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().expect("valid timestamp"),
    ));
    let service = DispatchService::with_clock(store.clone(), config, clock.clone());
    Harness {
        service,
        store,
        clock,
    }
}

static NEXT_IP: AtomicU32 = AtomicU32::new(1);

/// A fresh client IP, so rate limiting never couples unrelated tests.
pub fn fresh_ip() -> String {
    let n = NEXT_IP.fetch_add(1, Ordering::Relaxed);
    format!("10.0.{}.{}", n / 256, n % 256)
}

pub async fn scheduled_round(harness: &Harness, max_participants: i32) -> Round {
    let now = harness.clock.now();
    harness
        .service
        .create_round(NewRound {
            title: "Tuesday delivery round".to_string(),
            starts_at: now + Duration::hours(1),
            ends_at: now + Duration::hours(4),
            location: "Community center".to_string(),
            max_participants,
        })
        .await
        .expect("round created")
}

/// Sign a fresh user up as a volunteer; the lottery runs on signup, so
/// with free slots the returned signup is already confirmed.
pub async fn volunteer(harness: &Harness, round_id: RoundId) -> (UserId, Signup) {
    let user_id = UserId::new();
    let signup = harness
        .service
        .submit_signup(round_id, user_id, SignupRole::Volunteer)
        .await
        .expect("signup created");
    (user_id, signup)
}

/// Submit a guest order from a fresh IP, advancing the clock so
/// arrival order is unambiguous.
pub async fn guest_order(harness: &Harness) -> Order {
    harness.clock.advance(Duration::seconds(1));
    harness
        .service
        .submit_order(NewOrder {
            requester_id: None,
            client_ip: fresh_ip(),
            lines: vec![OrderLine {
                item: "meal kit".to_string(),
                quantity: 1,
            }],
            address: "12 Elm St".to_string(),
        })
        .await
        .expect("order submitted")
}

pub fn order_input(requester_id: Option<UserId>, client_ip: &str) -> NewOrder {
    NewOrder {
        requester_id,
        client_ip: client_ip.to_string(),
        lines: vec![OrderLine {
            item: "blanket".to_string(),
            quantity: 2,
        }],
        address: "4th & Main".to_string(),
    }
}
