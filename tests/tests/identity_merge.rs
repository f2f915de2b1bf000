//! User property updates and customer identity merges.
//!
//! Run with: cargo test -p integration-tests --test identity_merge

use std::collections::BTreeSet;

use engine_core::properties::numeric_or_zero;
use engine_core::{Error, MergeConfig, PropertySnapshot};
use integration_tests::fixtures::{props, user_record, PROJECT};
use integration_tests::setup::{TestConfig, TestContext};
use serde_json::json;
use worker::PropertyUpdate;

fn identity_pair(ctx: &TestContext) {
    ctx.store.add_users([
        user_record(
            "r1",
            Some("c1"),
            json!({ "$initial_campaign": "ads", "$country": "US", "$page_count": 3, "$session_count": 4 }),
            100,
            100,
        ),
        user_record(
            "r2",
            Some("c1"),
            json!({ "$initial_campaign": "brand", "$country": "US", "$page_count": 2 }),
            200,
            200,
        ),
    ]);
}

// =============================================================================
// Single record updates
// =============================================================================

#[tokio::test]
async fn test_unidentified_user_writes_single_record() {
    let ctx = TestContext::new();
    ctx.store
        .add_users([user_record("u1", None, json!({ "a": 1 }), 100, 100)]);

    let update = ctx
        .merger
        .update_user_properties(PROJECT, "u1", &props(json!({ "b": 2 })), 200)
        .await
        .unwrap();
    assert_eq!(update, PropertyUpdate::Single);

    let user = ctx.store.user("u1").unwrap();
    assert_eq!(user.properties_updated_timestamp, 200);
    assert_eq!(ctx.store.user_properties("u1"), props(json!({ "a": 1, "b": 2 })));
}

#[tokio::test]
async fn test_identical_properties_are_not_modified() {
    let ctx = TestContext::new();
    ctx.store
        .add_users([user_record("u1", None, json!({ "a": 1 }), 100, 100)]);

    let update = ctx
        .merger
        .update_user_properties(PROJECT, "u1", &props(json!({ "a": 1 })), 200)
        .await
        .unwrap();
    assert_eq!(update, PropertyUpdate::NotModified);
    assert!(ctx.store.overwrites().is_empty());
}

#[tokio::test]
async fn test_older_update_only_adds_missing_keys() {
    let ctx = TestContext::new();
    ctx.store
        .add_users([user_record("u1", None, json!({ "a": 1 }), 500, 100)]);

    ctx.merger
        .update_user_properties(PROJECT, "u1", &props(json!({ "a": 9, "b": 2 })), 100)
        .await
        .unwrap();

    assert_eq!(ctx.store.user_properties("u1"), props(json!({ "a": 1, "b": 2 })));
    assert_eq!(ctx.store.user("u1").unwrap().properties_updated_timestamp, 500);
}

#[tokio::test]
async fn test_missing_user_is_not_found() {
    let ctx = TestContext::new();
    let result = ctx
        .merger
        .update_user_properties(PROJECT, "ghost", &props(json!({ "a": 1 })), 100)
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_empty_identifiers_are_rejected() {
    let ctx = TestContext::new();
    let result = ctx
        .merger
        .update_user_properties(PROJECT, "", &props(json!({ "a": 1 })), 100)
        .await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

// =============================================================================
// Customer identity merge
// =============================================================================

#[tokio::test]
async fn test_merge_across_customer_identity() {
    let ctx = TestContext::new();
    identity_pair(&ctx);

    let update = ctx
        .merger
        .update_user_properties(PROJECT, "r2", &props(json!({ "$country": "IN" })), 300)
        .await
        .unwrap();
    assert_eq!(update, PropertyUpdate::Merged { records: 2 });

    for id in ["r1", "r2"] {
        let merged = ctx.store.user_properties(id);
        assert_eq!(merged.get("$initial_campaign"), Some(&json!("ads")), "record {}", id);
        assert_eq!(merged.get("$country"), Some(&json!("IN")), "record {}", id);
        assert_eq!(numeric_or_zero(&merged, "$page_count"), 5.0, "record {}", id);
        assert!(merged.contains_key("$merge_timestamp"), "record {}", id);
    }

    // Session counts stay per record.
    assert_eq!(ctx.store.user_properties("r1").get("$session_count"), Some(&json!(4)));
    assert!(ctx.store.user_properties("r2").get("$session_count").is_none());

    let written: BTreeSet<String> = ctx.store.overwrites().into_iter().map(|(id, _)| id).collect();
    assert_eq!(written, BTreeSet::from(["r1".to_string(), "r2".to_string()]));
}

#[tokio::test]
async fn test_agreeing_records_write_only_updated_record() {
    let ctx = TestContext::new();
    ctx.store.add_users([
        user_record("r1", Some("c1"), json!({ "$country": "IN" }), 100, 100),
        user_record("r2", Some("c1"), json!({ "$country": "US" }), 200, 200),
    ]);

    let update = ctx
        .merger
        .update_user_properties(PROJECT, "r2", &props(json!({ "$country": "IN" })), 300)
        .await
        .unwrap();
    assert_eq!(update, PropertyUpdate::Single);
    assert_eq!(ctx.store.overwrites(), vec![("r2".to_string(), 300)]);

    let r2 = ctx.store.user_properties("r2");
    assert_eq!(r2.get("$country"), Some(&json!("IN")));
    assert!(!r2.contains_key("$merge_timestamp"));
}

#[tokio::test]
async fn test_merge_fan_in_is_bounded() {
    let ctx = TestContext::with_config(TestConfig {
        merge: MergeConfig {
            max_records: 2,
            ..Default::default()
        },
        ..Default::default()
    });
    ctx.store.add_users((1..=4).map(|i| {
        user_record(
            &format!("r{}", i),
            Some("c1"),
            json!({ "k": format!("v{}", i) }),
            i * 100,
            i * 100,
        )
    }));

    let update = ctx
        .merger
        .update_user_properties(PROJECT, "r2", &props(json!({ "x": "new" })), 1000)
        .await
        .unwrap();
    assert_eq!(update, PropertyUpdate::Merged { records: 3 });

    let written: BTreeSet<String> = ctx.store.overwrites().into_iter().map(|(id, _)| id).collect();
    assert_eq!(
        written,
        BTreeSet::from(["r1".to_string(), "r2".to_string(), "r4".to_string()])
    );
    assert_eq!(ctx.store.user_properties("r3"), props(json!({ "k": "v3" })));
}

#[tokio::test]
async fn test_failed_write_back_surfaces_error() {
    let ctx = TestContext::new();
    identity_pair(&ctx);
    ctx.store.fail_overwrites_for("r1");

    let result = ctx
        .merger
        .update_user_properties(PROJECT, "r2", &props(json!({ "$country": "IN" })), 300)
        .await;
    assert!(matches!(result, Err(Error::Store(_))));

    // The other record is still written.
    assert_eq!(ctx.store.overwrites(), vec![("r2".to_string(), 300)]);
}

// =============================================================================
// Session rollups
// =============================================================================

fn snapshot(user_id: &str, session_timestamp: i64, page_count: f64, channel: Option<&str>) -> PropertySnapshot {
    PropertySnapshot {
        event_id: format!("{}-{}", user_id, session_timestamp + 1),
        user_id: user_id.to_string(),
        session_id: format!("s{}", session_timestamp),
        session_timestamp,
        session_count: if session_timestamp > 20 { 2 } else { 1 },
        page_count,
        spent_time: 0.0,
        channel: channel.map(str::to_string),
        event_user_properties: Some(json!({ "$page_count": 4 }).to_string()),
    }
}

#[tokio::test]
async fn test_rollup_writes_latest_session_and_channels() {
    let ctx = TestContext::new();
    ctx.store.add_users([user_record("u1", None, json!({}), 0, 0)]);

    let written = ctx
        .merger
        .apply_session_rollups(
            PROJECT,
            &[
                snapshot("u1", 10, 1.0, Some("Direct")),
                snapshot("u1", 50, 2.0, Some("Paid Search")),
            ],
            100,
        )
        .await
        .unwrap();
    assert_eq!(written, 1);

    let user = ctx.store.user_properties("u1");
    assert_eq!(numeric_or_zero(&user, "$page_count"), 6.0);
    assert_eq!(user.get("$session_count"), Some(&json!(2)));
    assert_eq!(user.get("$latest_channel"), Some(&json!("Paid Search")));
    assert_eq!(user.get("$initial_channel"), Some(&json!("Direct")));
}

#[tokio::test]
async fn test_rollup_keeps_existing_initial_channel() {
    let ctx = TestContext::new();
    ctx.store
        .add_users([user_record("u1", None, json!({ "$initial_channel": "Email" }), 0, 0)]);

    ctx.merger
        .apply_session_rollups(PROJECT, &[snapshot("u1", 10, 1.0, Some("Direct"))], 100)
        .await
        .unwrap();

    let user = ctx.store.user_properties("u1");
    assert_eq!(user.get("$initial_channel"), Some(&json!("Email")));
    assert_eq!(user.get("$latest_channel"), Some(&json!("Direct")));
}

#[tokio::test]
async fn test_rollup_skips_missing_user_and_empty_snapshot() {
    let ctx = TestContext::new();
    ctx.store.add_users([user_record("u2", None, json!({}), 0, 0)]);

    let mut empty = snapshot("u2", 10, 1.0, None);
    empty.event_user_properties = None;

    let written = ctx
        .merger
        .apply_session_rollups(PROJECT, &[snapshot("ghost", 10, 1.0, None), empty], 100)
        .await
        .unwrap();
    assert_eq!(written, 0);
    assert!(ctx.store.overwrites().is_empty());
}
