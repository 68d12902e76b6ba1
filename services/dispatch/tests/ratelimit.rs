//! Sliding-window rate limiting: per-requester and per-IP ceilings,
//! window expiry, and retention sweeps.

mod common;

use chrono::Duration;
use common::{fresh_ip, harness, order_input};
use rounds_dispatch::error::DispatchError;
use rounds_id::UserId;

#[tokio::test]
async fn fourth_submission_in_window_is_rejected() {
    let h = harness();
    let requester = UserId::new();
    let ip = fresh_ip();

    for _ in 0..3 {
        h.service
            .submit_order(order_input(Some(requester), &ip))
            .await
            .expect("admitted");
    }

    let err = h
        .service
        .submit_order(order_input(Some(requester), &ip))
        .await
        .expect_err("over the ceiling");
    match err {
        DispatchError::RateLimitExceeded(detail) => {
            assert_eq!(detail.count, 3);
            assert_eq!(detail.ceiling, 3);
        }
        other => panic!("expected rate limit rejection, got {other}"),
    }
}

#[tokio::test]
async fn window_expiry_readmits_the_identity() {
    let h = harness();
    let requester = UserId::new();
    let ip = fresh_ip();

    for _ in 0..3 {
        h.service
            .submit_order(order_input(Some(requester), &ip))
            .await
            .expect("admitted");
    }
    h.service
        .submit_order(order_input(Some(requester), &ip))
        .await
        .expect_err("over the ceiling");

    // The window is five minutes; once the earlier attempts fall out,
    // submission succeeds again.
    h.clock.advance(Duration::minutes(5) + Duration::seconds(1));
    h.service
        .submit_order(order_input(Some(requester), &ip))
        .await
        .expect("readmitted after the window");
}

#[tokio::test]
async fn requester_ceiling_spans_addresses() {
    let h = harness();
    let requester = UserId::new();

    for _ in 0..3 {
        h.service
            .submit_order(order_input(Some(requester), &fresh_ip()))
            .await
            .expect("admitted");
    }

    let err = h
        .service
        .submit_order(order_input(Some(requester), &fresh_ip()))
        .await
        .expect_err("requester is over regardless of address");
    match err {
        DispatchError::RateLimitExceeded(detail) => assert_eq!(detail.scope, "requester"),
        other => panic!("expected rate limit rejection, got {other}"),
    }
}

#[tokio::test]
async fn guests_are_limited_by_address_alone() {
    let h = harness();
    let shared_ip = fresh_ip();

    for _ in 0..3 {
        h.service
            .submit_order(order_input(None, &shared_ip))
            .await
            .expect("admitted");
    }
    let err = h
        .service
        .submit_order(order_input(None, &shared_ip))
        .await
        .expect_err("address is over");
    match err {
        DispatchError::RateLimitExceeded(detail) => assert_eq!(detail.scope, "ip"),
        other => panic!("expected rate limit rejection, got {other}"),
    }

    // A different address is unaffected.
    h.service
        .submit_order(order_input(None, &fresh_ip()))
        .await
        .expect("other address admitted");
}

#[tokio::test]
async fn admission_check_records_nothing() {
    let h = harness();
    let requester = UserId::new();
    let ip = fresh_ip();

    for _ in 0..10 {
        h.service
            .admit_order(Some(requester), &ip)
            .await
            .expect("check passes");
    }
    assert_eq!(h.store.rate_limit_record_count().await, 0);

    // All three real submissions still fit.
    for _ in 0..3 {
        h.service
            .submit_order(order_input(Some(requester), &ip))
            .await
            .expect("admitted");
    }
    h.service
        .admit_order(Some(requester), &ip)
        .await
        .expect_err("check now reports the full window");
}

#[tokio::test]
async fn rejected_submissions_do_not_consume_the_window() {
    let h = harness();
    let ip = fresh_ip();

    for _ in 0..3 {
        h.service
            .submit_order(order_input(None, &ip))
            .await
            .expect("admitted");
    }
    for _ in 0..5 {
        h.service
            .submit_order(order_input(None, &ip))
            .await
            .expect_err("rejected");
    }
    // Only the admitted attempts are on record.
    assert_eq!(h.store.rate_limit_record_count().await, 3);
}

#[tokio::test]
async fn sweep_prunes_expired_records() {
    let h = harness();
    for _ in 0..3 {
        h.service
            .submit_order(order_input(None, &fresh_ip()))
            .await
            .expect("admitted");
    }
    assert_eq!(h.store.rate_limit_record_count().await, 3);

    let sweeper = h.service.sweep_worker();

    // Inside the 24h retention nothing is removed.
    h.clock.advance(Duration::hours(1));
    assert_eq!(sweeper.sweep_once().await.expect("sweep"), 0);
    assert_eq!(h.store.rate_limit_record_count().await, 3);

    h.clock.advance(Duration::hours(24));
    assert_eq!(sweeper.sweep_once().await.expect("sweep"), 3);
    assert_eq!(h.store.rate_limit_record_count().await, 0);
}

#[tokio::test]
async fn invalid_orders_are_rejected_before_admission() {
    let h = harness();
    let ip = fresh_ip();

    let mut empty_lines = order_input(None, &ip);
    empty_lines.lines.clear();
    let err = h
        .service
        .submit_order(empty_lines)
        .await
        .expect_err("no lines");
    assert!(matches!(err, DispatchError::Validation(_)));

    let mut bad_quantity = order_input(None, &ip);
    bad_quantity.lines[0].quantity = 0;
    let err = h
        .service
        .submit_order(bad_quantity)
        .await
        .expect_err("zero quantity");
    assert!(matches!(err, DispatchError::Validation(_)));

    let mut blank_address = order_input(None, &ip);
    blank_address.address = "   ".to_string();
    let err = h
        .service
        .submit_order(blank_address)
        .await
        .expect_err("blank address");
    assert!(matches!(err, DispatchError::Validation(_)));

    // Rejected input consumed nothing from the window.
    assert_eq!(h.store.rate_limit_record_count().await, 0);
}
