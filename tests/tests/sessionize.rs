//! Per-user sessionization against the in-memory store.
//!
//! Run with: cargo test -p integration-tests --test sessionize

use std::sync::Arc;

use engine_core::properties::numeric_or_zero;
use engine_core::store::EventStore;
use engine_core::{Event, SessionConfig};
use integration_tests::fixtures::{self, page_event, props, with_user_properties, PROJECT};
use integration_tests::mocks::FailingClassifier;
use integration_tests::setup::{TestConfig, TestContext};
use serde_json::json;
use worker::UserRunOutcome;

const NOW: i64 = 100_000;

async fn sessionize(ctx: &TestContext, user_id: &str) -> UserRunOutcome {
    let mut pending = ctx
        .store
        .fetch_user_events_in_window(PROJECT, 0, NOW)
        .await
        .expect("fetch failed");
    let events = pending.remove(user_id).unwrap_or_default();
    ctx.users
        .run(PROJECT, user_id, events, NOW)
        .await
        .expect("user run failed")
}

fn session_of(ctx: &TestContext, event_id: &str) -> Option<String> {
    ctx.store.event(event_id).and_then(|e| e.session_id)
}

fn utm_context() -> TestContext {
    TestContext::with_attribution_fields(&["utm"])
}

// =============================================================================
// Boundaries
// =============================================================================

#[tokio::test]
async fn test_inactivity_gap_splits_sessions() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({})),
        page_event("u1", 1100, json!({})),
        page_event("u1", 6000, json!({})),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 2);
    assert_eq!(outcome.events_processed, 3);
    assert!(!outcome.continued);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].timestamp, 999);
    assert_eq!(markers[1].timestamp, 5999);

    assert_eq!(session_of(&ctx, "u1-1000"), Some(markers[0].id.clone()));
    assert_eq!(session_of(&ctx, "u1-1100"), Some(markers[0].id.clone()));
    assert_eq!(session_of(&ctx, "u1-6000"), Some(markers[1].id.clone()));

    let first = ctx.store.marker_properties(&markers[0].id);
    let second = ctx.store.marker_properties(&markers[1].id);
    assert_eq!(numeric_or_zero(&first, "$page_count"), 2.0);
    assert_eq!(numeric_or_zero(&second, "$page_count"), 1.0);
    assert_eq!(first.get("$is_first_session"), Some(&json!(true)));
    assert!(second.get("$is_first_session").is_none());
    assert_eq!(first.get("$session_count"), Some(&json!(1)));
    assert_eq!(second.get("$session_count"), Some(&json!(2)));
}

#[tokio::test]
async fn test_gap_equal_to_threshold_keeps_session() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({})),
        page_event("u1", 2800, json!({})),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 1);
    assert_eq!(session_of(&ctx, "u1-1000"), session_of(&ctx, "u1-2800"));
}

#[tokio::test]
async fn test_matching_attribution_chain_forms_one_session() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({ "utm": "x" })),
        page_event("u1", 1010, json!({ "utm": "x" })),
        page_event("u1", 1020, json!({ "utm": "x" })),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 1);

    let markers = ctx.store.markers("u1");
    let properties = ctx.store.marker_properties(&markers[0].id);
    assert_eq!(numeric_or_zero(&properties, "$page_count"), 3.0);
}

#[tokio::test]
async fn test_attribution_change_breaks_chain() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({ "utm": "x" })),
        page_event("u1", 1010, json!({ "utm": "x" })),
        page_event("u1", 1020, json!({ "utm": "y" })),
        page_event("u1", 1030, json!({ "utm": "y" })),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 2);

    let markers = ctx.store.markers("u1");
    assert_eq!(session_of(&ctx, "u1-1010"), Some(markers[0].id.clone()));
    assert_eq!(session_of(&ctx, "u1-1020"), Some(markers[1].id.clone()));
    assert_eq!(session_of(&ctx, "u1-1030"), Some(markers[1].id.clone()));
}

#[tokio::test]
async fn test_trailing_different_source_starts_new_session() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 10, json!({ "utm": "google" })),
        page_event("u1", 20, json!({ "utm": "google" })),
        page_event("u1", 30, json!({ "utm": "bing" })),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 2);
    assert_eq!(session_of(&ctx, "u1-10"), session_of(&ctx, "u1-20"));
    assert_ne!(session_of(&ctx, "u1-20"), session_of(&ctx, "u1-30"));
    assert!(session_of(&ctx, "u1-30").is_some());
}

#[tokio::test]
async fn test_attributed_event_after_plain_event_starts_new_session() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({})),
        page_event("u1", 1020, json!({ "utm": "x" })),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 2);
    assert_ne!(session_of(&ctx, "u1-1000"), session_of(&ctx, "u1-1020"));
}

#[tokio::test]
async fn test_every_event_is_covered_and_markers_precede_members() {
    let ctx = utm_context();
    ctx.store.add_events([
        page_event("u1", 1000, json!({})),
        page_event("u1", 1010, json!({ "utm": "x" })),
        page_event("u1", 5000, json!({})),
        page_event("u1", 5010, json!({})),
        page_event("u1", 9000, json!({ "utm": "y" })),
    ]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 4);

    let markers = ctx.store.markers("u1");
    let counts: Vec<u64> = markers.iter().map(|m| m.count).collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);

    for event in ctx.store.user_events("u1") {
        let session_id = event.session_id.clone().expect("event left without a session");
        let marker = markers
            .iter()
            .find(|m| m.id == session_id)
            .expect("session marker missing");
        assert!(marker.timestamp < event.timestamp);
        assert!(marker.session_id.is_none());
    }
}

// =============================================================================
// Continuation
// =============================================================================

#[tokio::test]
async fn test_continuation_across_runs() {
    let ctx = utm_context();
    ctx.store.add_events([page_event("u1", 1000, json!({}))]);
    let first = sessionize(&ctx, "u1").await;
    assert_eq!(first.sessions_created, 1);

    ctx.store.add_events([page_event("u1", 1200, json!({}))]);
    let second = sessionize(&ctx, "u1").await;
    assert!(second.continued);
    assert_eq!(second.sessions_created, 0);
    assert_eq!(second.events_processed, 1);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 1);
    assert_eq!(session_of(&ctx, "u1-1200"), Some(markers[0].id.clone()));

    let properties = ctx.store.marker_properties(&markers[0].id);
    assert_eq!(numeric_or_zero(&properties, "$page_count"), 2.0);
}

#[tokio::test]
async fn test_trailing_attributed_event_is_deferred_into_own_session() {
    let ctx = utm_context();
    ctx.store
        .add_events([page_event("u1", 1000, json!({ "utm": "x" }))]);
    sessionize(&ctx, "u1").await;

    ctx.store.add_events([
        page_event("u1", 1100, json!({})),
        page_event("u1", 1200, json!({ "utm": "y" })),
    ]);
    let outcome = sessionize(&ctx, "u1").await;
    assert!(outcome.continued);
    assert_eq!(outcome.sessions_created, 1);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 2);
    assert_eq!(session_of(&ctx, "u1-1100"), Some(markers[0].id.clone()));
    assert_eq!(session_of(&ctx, "u1-1200"), Some(markers[1].id.clone()));

    let continued = ctx.store.marker_properties(&markers[0].id);
    let deferred = ctx.store.marker_properties(&markers[1].id);
    assert_eq!(numeric_or_zero(&continued, "$page_count"), 2.0);
    assert_eq!(numeric_or_zero(&deferred, "$page_count"), 1.0);
    assert_eq!(markers[1].count, 2);
    assert!(deferred.get("$is_first_session").is_none());
}

#[tokio::test]
async fn test_new_attribution_drops_continuation() {
    let ctx = utm_context();
    ctx.store
        .add_events([page_event("u1", 1000, json!({ "utm": "x" }))]);
    sessionize(&ctx, "u1").await;

    ctx.store
        .add_events([page_event("u1", 1100, json!({ "utm": "y" }))]);
    let outcome = sessionize(&ctx, "u1").await;
    assert!(!outcome.continued);
    assert_eq!(outcome.sessions_created, 1);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 2);
    assert_eq!(session_of(&ctx, "u1-1100"), Some(markers[1].id.clone()));

    let earlier = ctx.store.marker_properties(&markers[0].id);
    assert_eq!(numeric_or_zero(&earlier, "$page_count"), 1.0);
}

#[tokio::test]
async fn test_missing_continuation_session_creates_new_session() {
    let ctx = utm_context();
    let mut stale = page_event("u1", 1000, json!({}));
    stale.session_id = Some("ghost".to_string());
    ctx.store.add_events([stale, page_event("u1", 1100, json!({}))]);

    let outcome = sessionize(&ctx, "u1").await;
    assert!(!outcome.continued);
    assert_eq!(outcome.sessions_created, 1);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].timestamp, 999);
    assert_eq!(session_of(&ctx, "u1-1000"), Some(markers[0].id.clone()));
    assert_eq!(session_of(&ctx, "u1-1100"), Some(markers[0].id.clone()));

    // The stale event was counted by the run that first sessioned it.
    let properties = ctx.store.marker_properties(&markers[0].id);
    assert_eq!(numeric_or_zero(&properties, "$page_count"), 1.0);
    assert_eq!(properties.get("$is_first_session"), Some(&json!(true)));
}

// =============================================================================
// Session properties
// =============================================================================

#[tokio::test]
async fn test_session_properties_channel_and_user_rollup() {
    let ctx = TestContext::new();
    ctx.store.add_users([fixtures::user_record(
        "u1",
        None,
        json!({ "$country": "IN" }),
        500,
        500,
    )]);
    ctx.store.add_events([with_user_properties(
        page_event(
            "u1",
            1000,
            json!({ "$medium": "email", "$page_url": "example.com/pricing", "$page_spent_time": 12 }),
        ),
        json!({ "$country": "IN" }),
    )]);

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 1);
    assert_eq!(outcome.user_properties_updated, 1);

    let markers = ctx.store.markers("u1");
    let session = ctx.store.marker_properties(&markers[0].id);
    assert_eq!(session.get("$channel"), Some(&json!("Email")));
    assert_eq!(session.get("$medium"), Some(&json!("email")));
    assert_eq!(session.get("$initial_page_url"), Some(&json!("example.com/pricing")));
    assert_eq!(session.get("$session_latest_page_url"), Some(&json!("example.com/pricing")));
    assert_eq!(session.get("$country"), Some(&json!("IN")));
    assert_eq!(numeric_or_zero(&session, "$session_spent_time"), 12.0);

    let user = ctx.store.user_properties("u1");
    assert_eq!(user.get("$latest_channel"), Some(&json!("Email")));
    assert_eq!(user.get("$initial_channel"), Some(&json!("Email")));
    assert_eq!(user.get("$session_count"), Some(&json!(1)));
    assert_eq!(numeric_or_zero(&user, "$page_count"), 1.0);
    assert_eq!(ctx.store.overwrites(), vec![("u1".to_string(), NOW)]);
}

fn failing_classifier_context() -> TestContext {
    TestContext::with_config(TestConfig {
        classifier: Some(Arc::new(FailingClassifier)),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_classification_failure_omits_channel() {
    let ctx = failing_classifier_context();
    let event = page_event("u1", 1000, json!({ "$medium": "email", "$page_url": "example.com" }));
    ctx.store.add_events([event.clone()]);

    let session = ctx
        .materializer
        .materialize(PROJECT, &[event.clone()], &[props(json!({ "$medium": "email", "$page_url": "example.com" }))])
        .await
        .unwrap();
    assert!(!session.continued);
    assert_eq!(session.channel, None);
    assert_eq!(session.associated, 1);
    assert_eq!(session.total_aggregate.page_count, 1.0);
    assert!(session.snapshots.iter().all(|snapshot| snapshot.channel.is_none()));

    // The rest of the session update still lands on the marker.
    let properties = ctx.store.marker_properties(&session.session_id);
    assert!(properties.get("$channel").is_none());
    assert_eq!(numeric_or_zero(&properties, "$page_count"), 1.0);
    assert_eq!(properties.get("$session_count"), Some(&json!(1)));
    assert_eq!(properties.get("$session_latest_page_url"), Some(&json!("example.com")));
    assert_eq!(session_of(&ctx, &event.id), Some(session.session_id.clone()));
}

#[tokio::test]
async fn test_classification_failure_does_not_fail_user_run() {
    let ctx = failing_classifier_context();
    ctx.store.add_events([with_user_properties(
        page_event("u1", 1000, json!({ "$medium": "email" })),
        json!({ "$country": "IN" }),
    )]);

    // No user record exists either, so the rollup is skipped as well.
    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 1);
    assert_eq!(outcome.user_properties_updated, 0);

    let markers = ctx.store.markers("u1");
    assert_eq!(markers.len(), 1);
    assert!(ctx.store.marker_properties(&markers[0].id).get("$channel").is_none());
}

#[tokio::test]
async fn test_association_is_chunked() {
    let ctx = TestContext::with_config(TestConfig {
        session: SessionConfig {
            association_batch_size: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    ctx.store
        .add_events((0..5).map(|i| page_event("u1", 1000 + i * 10, json!({}))));

    let outcome = sessionize(&ctx, "u1").await;
    assert_eq!(outcome.sessions_created, 1);

    let sizes: Vec<usize> = ctx
        .store
        .associations()
        .iter()
        .map(|(_, ids)| ids.len())
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_malformed_properties_fail_the_user_run() {
    let ctx = utm_context();
    let mut broken = page_event("u1", 1000, json!({}));
    broken.properties = "{not json".to_string();

    let result = ctx.users.run(PROJECT, "u1", vec![broken], NOW).await;
    let err = result.expect_err("malformed properties must fail the run");
    assert_eq!(err.error_code(), "SESSION_003");
    assert!(ctx.store.markers("u1").is_empty());
}

#[tokio::test]
async fn test_store_failure_fails_the_user_run() {
    let ctx = utm_context();
    let events: Vec<Event> = vec![page_event("u1", 1000, json!({}))];
    ctx.store.add_events(events.clone());
    ctx.set_store_failure(true);

    let result = ctx.users.run(PROJECT, "u1", events, NOW).await;
    assert!(result.is_err());

    ctx.set_store_failure(false);
    assert!(ctx.store.markers("u1").is_empty());
}

#[tokio::test]
async fn test_empty_input_is_not_modified() {
    let ctx = utm_context();
    let outcome = ctx.users.run(PROJECT, "u1", Vec::new(), NOW).await.unwrap();
    assert_eq!(outcome.events_processed, 0);
    assert_eq!(outcome.status(), engine_core::RunStatus::NotModified);
}
