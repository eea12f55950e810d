//! Billing read-path scenarios over a materialized store: aggregation
//! semantics per meter shape and the charges they produce.

mod support;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use support::*;
use turnstile_metering::config::ReadSource;
use turnstile_metering::domain::{Event, SubscriptionId};
use turnstile_metering::materializer::{Materializer, StaticCatalogProvider};
use turnstile_metering::store::{EventStore, MemoryEventStore};
use turnstile_metering::usage::UsageEngine;

struct Context {
    store: Arc<MemoryEventStore>,
    catalog: Arc<StaticCatalogProvider>,
    materializer: Arc<Materializer>,
    engine: UsageEngine,
}

impl Context {
    async fn new() -> Self {
        let store = new_store();
        let catalog = seeded_catalog().await;
        let materializer = Materializer::new(store.clone(), catalog.clone());
        let engine = UsageEngine::new(store.clone(), catalog.clone(), ReadSource::Live);
        Self {
            store,
            catalog,
            materializer,
            engine,
        }
    }

    async fn ingest(&self, id: &str, event_name: &str, at: DateTime<Utc>, props: serde_json::Value) {
        let event: Event =
            serde_json::from_slice(&event_payload(id, event_name, at, props)).unwrap();
        self.store.insert_events(&[event]).await.unwrap();
    }

    async fn materialize(&self) {
        self.materializer
            .materialize_window(
                &scope(),
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();
    }

    async fn usage(&self) -> turnstile_metering::usage::SubscriptionUsage {
        self.engine
            .usage_for_subscription(
                &SubscriptionId::new(SUBSCRIPTION),
                Some(period_start()),
                Some(period_end()),
            )
            .await
            .unwrap()
    }
}

fn at(hour: i64) -> DateTime<Utc> {
    period_start() + ChronoDuration::hours(hour)
}

#[tokio::test]
async fn test_count_unique_is_idempotent_across_duplicates() {
    let ctx = Context::new().await;

    // The same event id arrives three times with user=u1.
    for _ in 0..3 {
        ctx.ingest("evt-1", "user_active", at(1), json!({"user": "u1"}))
            .await;
    }
    ctx.materialize().await;

    let usage = ctx.usage().await;
    let users = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_users")
        .unwrap();
    assert_eq!(users.quantity, dec!(1));

    // A second distinct event for the same user still counts once.
    ctx.ingest("evt-2", "user_active", at(2), json!({"user": "u1"}))
        .await;
    ctx.materialize().await;
    let usage = ctx.usage().await;
    let users = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_users")
        .unwrap();
    assert_eq!(users.quantity, dec!(1));

    // A different user moves the needle.
    ctx.ingest("evt-3", "user_active", at(3), json!({"user": "u2"}))
        .await;
    ctx.materialize().await;
    let usage = ctx.usage().await;
    let users = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_users")
        .unwrap();
    assert_eq!(users.quantity, dec!(2));
}

#[tokio::test]
async fn test_latest_follows_event_time_not_arrival_order() {
    let ctx = Context::new().await;

    // Arrival order: t=1 (qty 5), t=3 (qty 2), t=2 (qty 9).
    ctx.ingest("evt-1", "seat_count", at(1), json!({"qty": 5}))
        .await;
    ctx.ingest("evt-2", "seat_count", at(3), json!({"qty": 2}))
        .await;
    ctx.ingest("evt-3", "seat_count", at(2), json!({"qty": 9}))
        .await;
    ctx.materialize().await;

    let usage = ctx.usage().await;
    let seats = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_seats")
        .unwrap();
    assert_eq!(seats.quantity, dec!(2));
    // 2 seats at $10 each.
    assert_eq!(seats.breakdown.total, dec!(20));
}

#[tokio::test]
async fn test_duplicate_delivery_does_not_change_billable_units() {
    let ctx = Context::new().await;

    for i in 0..5 {
        ctx.ingest(&format!("evt-{i}"), "api_call", at(i), json!({}))
            .await;
    }
    ctx.materialize().await;
    let before = ctx.usage().await;

    // Replay every event and rebuild; the aggregate must not move.
    for i in 0..5 {
        ctx.ingest(&format!("evt-{i}"), "api_call", at(i), json!({}))
            .await;
    }
    ctx.materialize().await;
    let after = ctx.usage().await;

    let api_before = before
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_api")
        .unwrap();
    let api_after = after
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_api")
        .unwrap();
    assert_eq!(api_before.quantity, dec!(5));
    assert_eq!(api_after.quantity, dec!(5));
    assert_eq!(before.total, after.total);
}

#[tokio::test]
async fn test_tiered_volume_charge_for_api_calls() {
    let ctx = Context::new().await;

    // 101 distinct api calls land in the second volume tier.
    for i in 0..101 {
        ctx.ingest(&format!("evt-{i}"), "api_call", at(i % 24), json!({}))
            .await;
    }
    ctx.materialize().await;

    let usage = ctx.usage().await;
    let api = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_api")
        .unwrap();
    assert_eq!(api.quantity, dec!(101));
    assert_eq!(api.breakdown.total, dec!(8.08));
}

#[tokio::test]
async fn test_max_meter_and_combined_total() {
    let ctx = Context::new().await;

    // Storage peaks at 120 GB.
    ctx.ingest("gb-1", "gb_hours", at(1), json!({"gb": 80}))
        .await;
    ctx.ingest("gb-2", "gb_hours", at(2), json!({"gb": 120}))
        .await;
    ctx.ingest("gb-3", "gb_hours", at(3), json!({"gb": 50}))
        .await;
    // Ten api calls in tier one.
    for i in 0..10 {
        ctx.ingest(&format!("api-{i}"), "api_call", at(i), json!({}))
            .await;
    }
    ctx.materialize().await;

    let usage = ctx.usage().await;
    let storage = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_storage")
        .unwrap();
    assert_eq!(storage.quantity, dec!(120));
    // 120 GB at $0.02.
    assert_eq!(storage.breakdown.total, dec!(2.40));

    let api = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_api")
        .unwrap();
    assert_eq!(api.breakdown.total, dec!(1.00));

    assert_eq!(usage.total, dec!(3.40));
    assert_eq!(usage.display_total, dec!(3.40));
    assert_eq!(usage.currency, "USD");
}

#[tokio::test]
async fn test_window_clamp_excludes_out_of_period_events() {
    let ctx = Context::new().await;

    ctx.ingest("in-window", "api_call", at(1), json!({})).await;
    // Event-time outside the requested period; ingested now either way.
    ctx.ingest(
        "out-of-window",
        "api_call",
        period_start() - ChronoDuration::days(2),
        json!({}),
    )
    .await;
    ctx.materialize().await;

    let usage = ctx.usage().await;
    let api = usage
        .line_items
        .iter()
        .find(|item| item.line_item_id == "li_api")
        .unwrap();
    assert_eq!(api.quantity, dec!(1));
}

#[tokio::test]
async fn test_unknown_subscription_is_a_typed_error() {
    let ctx = Context::new().await;
    let err = ctx
        .engine
        .usage_for_subscription(&SubscriptionId::new("sub_missing"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        turnstile_metering::MeteringError::NotFound { .. }
    ));
}

#[tokio::test]
async fn test_broken_tiers_refuse_to_bill_only_that_subscription() {
    let ctx = Context::new().await;

    // Corrupt the api price's tiers in a fresh snapshot.
    let mut snapshot = seeded_snapshot();
    for price in &mut snapshot.prices {
        if price.id.as_str() == "price_api" {
            price.tiers.reverse();
        }
    }
    ctx.catalog.replace(&scope(), snapshot).await;

    ctx.ingest("evt-1", "api_call", at(1), json!({})).await;
    ctx.materialize().await;

    let err = ctx
        .engine
        .usage_for_subscription(&SubscriptionId::new(SUBSCRIPTION), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        turnstile_metering::MeteringError::InvalidPrice { .. }
    ));
}
