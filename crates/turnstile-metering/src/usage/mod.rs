//! Usage read path: what does a subscription owe for a period.
//!
//! One store query per call. The aggregation result is grouped by feature;
//! each line item picks its quantity out of that result according to its
//! meter's aggregation shape, then the calculator turns quantities into
//! money. There is deliberately no per-meter query fan-out.

use crate::config::ReadSource;
use crate::domain::{
    Aggregation, BucketWindow, Feature, FeatureId, LineItem, Meter, MeterId, Price, PriceId,
    SubscriptionId,
};
use crate::error::{MeteringError, Result};
use crate::materializer::CatalogProvider;
use crate::pricing::{self, CostBreakdown};
use crate::store::{EventScope, EventStore, FeatureUsage, UsageQuery};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// One line item's share of a usage charge.
#[derive(Debug, Clone)]
pub struct LineItemCharge {
    pub line_item_id: String,
    pub price_id: PriceId,
    pub meter_id: MeterId,
    pub feature_id: Option<FeatureId>,
    pub quantity: Decimal,
    pub breakdown: CostBreakdown,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionUsage {
    pub subscription_id: SubscriptionId,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub currency: String,
    pub line_items: Vec<LineItemCharge>,
    /// Full-precision sum of line totals.
    pub total: Decimal,
    /// `total` rounded to the currency's minor units, display only.
    pub display_total: Decimal,
}

struct PlannedItem<'a> {
    item: &'a LineItem,
    price: &'a Price,
    meter: &'a Meter,
    feature: Option<&'a Feature>,
}

pub struct UsageEngine {
    store: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogProvider>,
    source: ReadSource,
}

impl UsageEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        catalog: Arc<dyn CatalogProvider>,
        source: ReadSource,
    ) -> Self {
        Self {
            store,
            catalog,
            source,
        }
    }

    /// Usage and charges for a subscription over [start, end), clamped to
    /// the subscription's lifetime and current period. `None` bounds mean
    /// lifetime usage.
    pub async fn usage_for_subscription(
        &self,
        subscription_id: &SubscriptionId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<SubscriptionUsage> {
        let subscription = self.catalog.subscription(subscription_id).await?;
        let scope = EventScope {
            tenant_id: subscription.tenant_id.clone(),
            environment_id: subscription.environment_id.clone(),
        };
        let snapshot = self.catalog.snapshot(&scope).await?;
        let customer = snapshot
            .customer(&subscription.customer_id)
            .ok_or_else(|| MeteringError::NotFound {
                entity: "customer".to_string(),
                id: subscription.customer_id.to_string(),
            })?;

        let (period_start, period_end) = subscription.clamp_period(start, end);
        let now = Utc::now();

        // Plan: resolve every usage line item to (price, meter, feature) and
        // refuse to bill on any structurally bad or unusable price.
        let mut planned = Vec::new();
        for item in &subscription.line_items {
            let price =
                snapshot
                    .price(&item.price_id)
                    .ok_or_else(|| MeteringError::NotFound {
                        entity: "price".to_string(),
                        id: item.price_id.to_string(),
                    })?;
            let Some(meter_id) = price.meter_id.as_ref().or(item.meter_id.as_ref()) else {
                // Fixed recurring items are invoicing concerns, not usage.
                continue;
            };
            price.validate()?;
            if !price.is_usable(now) {
                return Err(MeteringError::InvalidPrice {
                    price_id: price.id.to_string(),
                    reason: "not published or outside its validity window".to_string(),
                });
            }
            if price.currency != subscription.currency {
                return Err(MeteringError::InvalidPrice {
                    price_id: price.id.to_string(),
                    reason: format!(
                        "currency {} does not match subscription currency {}",
                        price.currency, subscription.currency
                    ),
                });
            }
            let meter = snapshot
                .meter(meter_id)
                .ok_or_else(|| MeteringError::NotFound {
                    entity: "meter".to_string(),
                    id: meter_id.to_string(),
                })?;
            planned.push(PlannedItem {
                item,
                price,
                meter,
                feature: snapshot.feature_for_meter(&meter.id),
            });
        }

        // Planning-time skip: if none of the meters' events ever fired in
        // this scope there is nothing to scan.
        let fired: HashSet<String> = self
            .store
            .distinct_event_names(&scope)
            .await?
            .into_iter()
            .collect();
        let any_fired = planned
            .iter()
            .any(|plan| fired.contains(&plan.meter.event_name));

        let usage_by_feature = if any_fired {
            let mut bucket_windows: Vec<BucketWindow> = Vec::new();
            for plan in &planned {
                if let Some(window) = plan.meter.aggregation.bucket() {
                    if !bucket_windows.contains(&window) {
                        bucket_windows.push(window);
                    }
                }
            }
            self.store
                .aggregate_usage(&UsageQuery {
                    scope: scope.clone(),
                    subscription_id: subscription.id.clone(),
                    customer_id: Some(customer.id.clone()),
                    external_customer_id: Some(customer.external_id.clone()),
                    start: period_start,
                    end: period_end,
                    source: self.source,
                    bucket_windows,
                })
                .await?
        } else {
            debug!(subscription = %subscription.id, "No metered events in scope, skipping scan");
            Default::default()
        };

        let zero = FeatureUsage::default();
        let mut line_items = Vec::with_capacity(planned.len());
        let mut total = Decimal::ZERO;
        for plan in &planned {
            let usage = plan
                .feature
                .and_then(|feature| usage_by_feature.get(&feature.id))
                .unwrap_or(&zero);
            let quantity = pick_quantity(&plan.meter.aggregation, usage);
            let breakdown = pricing::charge(plan.price, quantity)?;
            total += breakdown.total;
            line_items.push(LineItemCharge {
                line_item_id: plan.item.id.clone(),
                price_id: plan.price.id.clone(),
                meter_id: plan.meter.id.clone(),
                feature_id: plan.feature.map(|f| f.id.clone()),
                quantity,
                breakdown,
                currency: plan.price.currency.clone(),
            });
        }

        Ok(SubscriptionUsage {
            subscription_id: subscription.id.clone(),
            period_start,
            period_end,
            currency: subscription.currency.clone(),
            line_items,
            total,
            display_total: pricing::display_amount(total, &subscription.currency),
        })
    }
}

/// Select the quantity for an aggregation shape out of the one query result.
fn pick_quantity(aggregation: &Aggregation, usage: &FeatureUsage) -> Decimal {
    match aggregation {
        Aggregation::Sum { .. } => usage.sum_total,
        Aggregation::SumWithMultiplier { multiplier, .. } => usage.sum_total * *multiplier,
        Aggregation::Max { bucket: Some(window), .. } => usage
            .bucketed_max
            .get(window)
            .copied()
            .unwrap_or(Decimal::ZERO),
        Aggregation::Max { bucket: None, .. } => usage.max_total,
        Aggregation::Count => Decimal::from(usage.count_distinct_ids),
        Aggregation::CountUnique { .. } => Decimal::from(usage.count_distinct_unique_hash),
        Aggregation::Latest { .. } => usage.latest_qty,
    }
}
