//! Shared fixtures: a seeded catalog, in-memory log and store, and payload
//! builders for driving the pipeline end to end without external services.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use turnstile_metering::config::{BatchConfig, MalformedPolicy};
use turnstile_metering::domain::prices::{
    BillingModel, BillingPeriod, EntityScope, PriceStatus, PriceTier, TierMode,
};
use turnstile_metering::domain::{
    Aggregation, Customer, CustomerId, EnvironmentId, Feature, FeatureId, LineItem, Meter,
    MeterId, Price, PriceId, Subscription, SubscriptionId, SubscriptionStatus, TenantId,
};
use turnstile_metering::ingest::MemoryEventLog;
use turnstile_metering::materializer::{CatalogSnapshot, StaticCatalogProvider};
use turnstile_metering::store::{EventScope, MemoryEventStore};

pub const TENANT: &str = "t1";
pub const ENVIRONMENT: &str = "prod";
pub const CUSTOMER_EXTERNAL: &str = "cust-acme";
pub const SUBSCRIPTION: &str = "sub_1";

pub fn scope() -> EventScope {
    EventScope {
        tenant_id: TenantId::new(TENANT),
        environment_id: EnvironmentId::new(ENVIRONMENT),
    }
}

pub fn period_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
}

pub fn period_end() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap()
}

pub fn batch_config(max_size: usize, max_interval_ms: u64) -> BatchConfig {
    BatchConfig {
        max_size,
        max_interval_ms,
        malformed_policy: MalformedPolicy::DeadLetter,
    }
}

fn meter(id: &str, event_name: &str, aggregation: Aggregation) -> Meter {
    Meter {
        id: MeterId::new(id),
        name: id.to_string(),
        event_name: event_name.to_string(),
        filters: vec![],
        aggregation,
    }
}

fn feature(id: &str, meter: &str) -> Feature {
    Feature {
        id: FeatureId::new(id),
        name: id.to_string(),
        meter_id: MeterId::new(meter),
    }
}

fn usage_price(id: &str, meter: &str, amount: rust_decimal::Decimal) -> Price {
    Price {
        id: PriceId::new(id),
        amount,
        currency: "USD".to_string(),
        billing_period: BillingPeriod::Monthly,
        billing_period_count: 1,
        billing_model: BillingModel::Flat,
        tier_mode: None,
        tiers: vec![],
        transform: None,
        meter_id: Some(MeterId::new(meter)),
        entity_scope: EntityScope::Plan,
        parent_price_id: None,
        start_date: None,
        end_date: None,
        trial_days: 0,
        commitment: None,
        status: PriceStatus::Published,
    }
}

/// The volume-tier reference price list.
fn tiered_price(id: &str, meter: &str, mode: TierMode) -> Price {
    let mut price = usage_price(id, meter, rust_decimal::Decimal::ZERO);
    price.billing_model = BillingModel::Tiered;
    price.tier_mode = Some(mode);
    price.tiers = vec![
        PriceTier {
            up_to: Some(100),
            unit_amount: dec!(0.10),
            flat_amount: rust_decimal::Decimal::ZERO,
        },
        PriceTier {
            up_to: Some(1000),
            unit_amount: dec!(0.08),
            flat_amount: rust_decimal::Decimal::ZERO,
        },
        PriceTier {
            up_to: None,
            unit_amount: dec!(0.05),
            flat_amount: dec!(5),
        },
    ];
    price
}

fn line_item(id: &str, price: &str, meter: &str) -> LineItem {
    LineItem {
        id: id.to_string(),
        subscription_id: SubscriptionId::new(SUBSCRIPTION),
        price_id: PriceId::new(price),
        meter_id: Some(MeterId::new(meter)),
        quantity: 1,
        active_from: None,
        active_until: None,
    }
}

/// One subscription billing four meters: tiered COUNT of api calls, MAX of
/// storage, COUNT_UNIQUE of active users, LATEST of seat count.
pub fn seeded_snapshot() -> CatalogSnapshot {
    CatalogSnapshot {
        meters: vec![
            meter("m_api", "api_call", Aggregation::Count),
            meter(
                "m_storage",
                "gb_hours",
                Aggregation::Max {
                    property: "gb".to_string(),
                    bucket: None,
                },
            ),
            meter(
                "m_users",
                "user_active",
                Aggregation::CountUnique {
                    property: "user".to_string(),
                },
            ),
            meter(
                "m_seats",
                "seat_count",
                Aggregation::Latest {
                    property: "qty".to_string(),
                },
            ),
        ],
        features: vec![
            feature("f_api", "m_api"),
            feature("f_storage", "m_storage"),
            feature("f_users", "m_users"),
            feature("f_seats", "m_seats"),
        ],
        prices: vec![
            tiered_price("price_api", "m_api", TierMode::Volume),
            usage_price("price_storage", "m_storage", dec!(0.02)),
            usage_price("price_users", "m_users", dec!(1.50)),
            usage_price("price_seats", "m_seats", dec!(10)),
        ],
        subscriptions: vec![Subscription {
            id: SubscriptionId::new(SUBSCRIPTION),
            tenant_id: TenantId::new(TENANT),
            environment_id: EnvironmentId::new(ENVIRONMENT),
            customer_id: CustomerId::new("cust_1"),
            plan_id: "plan_pro".to_string(),
            currency: "USD".to_string(),
            status: SubscriptionStatus::Active,
            start_date: period_start(),
            end_date: None,
            current_period_start: period_start(),
            current_period_end: period_end(),
            billing_anchor: period_start(),
            paused_at: None,
            line_items: vec![
                line_item("li_api", "price_api", "m_api"),
                line_item("li_storage", "price_storage", "m_storage"),
                line_item("li_users", "price_users", "m_users"),
                line_item("li_seats", "price_seats", "m_seats"),
            ],
        }],
        customers: vec![Customer {
            id: CustomerId::new("cust_1"),
            external_id: CUSTOMER_EXTERNAL.to_string(),
            name: "Acme".to_string(),
        }],
    }
}

pub async fn seeded_catalog() -> Arc<StaticCatalogProvider> {
    let catalog = StaticCatalogProvider::new();
    catalog.replace(&scope(), seeded_snapshot()).await;
    catalog
}

pub fn event_payload(
    id: &str,
    event_name: &str,
    at: DateTime<Utc>,
    properties: serde_json::Value,
) -> Vec<u8> {
    json!({
        "id": id,
        "tenant_id": TENANT,
        "environment_id": ENVIRONMENT,
        "event_name": event_name,
        "external_customer_id": CUSTOMER_EXTERNAL,
        "timestamp": at,
        "properties": properties,
        "source": "api",
    })
    .to_string()
    .into_bytes()
}

pub fn new_log() -> Arc<MemoryEventLog> {
    MemoryEventLog::new()
}

pub fn new_store() -> Arc<MemoryEventStore> {
    Arc::new(MemoryEventStore::new())
}
