//! Materializer: attributes raw events to billing tuples and writes the
//! processed rows the read path aggregates over.

pub mod catalog;
pub mod routing;

pub use catalog::{CatalogProvider, CatalogSnapshot, StaticCatalogProvider};
pub use routing::{RoutingEntry, RoutingTable};

use crate::domain::prices::BillingPeriod;
use crate::domain::{
    unique_hash, Event, Meter, PeriodId, Price, ProcessedEvent, ProcessedStatus, Subscription,
};
use crate::domain::Aggregation;
use crate::error::{MeteringError, Result};
use crate::pricing;
use crate::store::{EventScope, EventStore, RawTimeColumn};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one materialization pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeOutcome {
    pub written: usize,
    pub unmatched: usize,
    pub failed: usize,
}

pub struct Materializer {
    store: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogProvider>,
}

impl Materializer {
    pub fn new(store: Arc<dyn EventStore>, catalog: Arc<dyn CatalogProvider>) -> Arc<Self> {
        Arc::new(Self { store, catalog })
    }

    /// Attribute every raw event ingested in [start, end) and bulk-write the
    /// processed rows. Safe to re-run: rows are idempotent under the
    /// replacing-merge key.
    pub async fn materialize_window(
        &self,
        scope: &EventScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MaterializeOutcome> {
        let snapshot = self.catalog.snapshot(scope).await?;
        let table = RoutingTable::build(&snapshot, Utc::now());
        let events = self
            .store
            .fetch_raw_events(scope, RawTimeColumn::IngestedAt, start, end)
            .await?;
        self.process_events(&table, &events).await
    }

    /// Rebuild processed rows for an event-time range, fenced by the run
    /// start so rows a concurrent live pass writes are preserved: only rows
    /// whose processed_at predates the fence are deleted, and only after the
    /// rebuilt rows have landed.
    pub async fn reprocess(
        &self,
        scope: &EventScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MaterializeOutcome> {
        let fence = Utc::now();
        let snapshot = self.catalog.snapshot(scope).await?;
        let table = RoutingTable::build(&snapshot, fence);
        let events = self
            .store
            .fetch_raw_events(scope, RawTimeColumn::EventTime, start, end)
            .await?;

        let outcome = self.process_events(&table, &events).await?;
        let deleted = self
            .store
            .delete_processed_before(scope, start, end, fence)
            .await?;
        info!(
            tenant = %scope.tenant_id,
            environment = %scope.environment_id,
            written = outcome.written,
            deleted,
            "Reprocessing pass complete"
        );
        Ok(outcome)
    }

    async fn process_events(
        &self,
        table: &RoutingTable,
        events: &[Event],
    ) -> Result<MaterializeOutcome> {
        let mut outcome = MaterializeOutcome::default();
        let processed_at = Utc::now();
        let mut rows = Vec::with_capacity(events.len());

        for event in events {
            match table.route(event) {
                Some(entry) => match build_row(event, entry, processed_at) {
                    Ok(row) => {
                        rows.push(row);
                        outcome.written += 1;
                    }
                    Err(e) => {
                        // One bad event never blocks the batch.
                        warn!(event_id = %event.id, error = %e, "materializer.attribution_failed");
                        rows.push(failed_row(event, entry, processed_at));
                        outcome.failed += 1;
                    }
                },
                None => {
                    // Visible in counts, bills nothing.
                    rows.push(ProcessedEvent::unattributed(event, processed_at));
                    outcome.unmatched += 1;
                }
            }
        }

        if !rows.is_empty() {
            self.store.insert_processed(&rows).await?;
        }
        Ok(outcome)
    }

    /// Periodic driver: every `interval`, materialize the trailing `window`
    /// for each scope the catalog knows about.
    pub async fn run(
        self: Arc<Self>,
        window: std::time::Duration,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        info!("Materializer started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let scopes = match self.catalog.scopes().await {
                Ok(scopes) => scopes,
                Err(e) => {
                    error!(error = %e, "Failed to list catalog scopes");
                    continue;
                }
            };

            let end = Utc::now();
            let start = end
                - Duration::milliseconds(window.as_millis().min(i64::MAX as u128) as i64);
            for scope in scopes {
                match self.materialize_window(&scope, start, end).await {
                    Ok(outcome) => {
                        debug!(
                            tenant = %scope.tenant_id,
                            environment = %scope.environment_id,
                            written = outcome.written,
                            unmatched = outcome.unmatched,
                            failed = outcome.failed,
                            "materializer.run_completed"
                        );
                    }
                    Err(e) => {
                        error!(
                            tenant = %scope.tenant_id,
                            environment = %scope.environment_id,
                            error = %e,
                            "Materialization pass failed"
                        );
                    }
                }
            }
        }
        info!("Materializer stopped");
    }
}

/// Approximate period length, stepped from the subscription's current period
/// to find the one containing the event.
fn period_length(period: BillingPeriod, count: u32) -> Duration {
    let one = match period {
        BillingPeriod::Daily => Duration::days(1),
        BillingPeriod::Weekly => Duration::weeks(1),
        BillingPeriod::Monthly => Duration::days(30), // Approximate
        BillingPeriod::Annual => Duration::days(365),
    };
    one * count.max(1) as i32
}

fn period_start_for(
    subscription: &Subscription,
    price: &Price,
    at: DateTime<Utc>,
) -> DateTime<Utc> {
    let length = period_length(price.billing_period, price.billing_period_count);
    let mut start = subscription.current_period_start;
    // Bounded walk; anything further out than this is clock garbage and maps
    // to the nearest representable period.
    for _ in 0..1_000 {
        if at < start {
            start -= length;
        } else if at >= start + length {
            start += length;
        } else {
            break;
        }
    }
    start.max(subscription.start_date)
}

/// Extract the aggregation field per the meter's shape and coerce it to the
/// unsigned billable quantity.
fn extract_quantity(meter: &Meter, event: &Event) -> Result<(Option<String>, u64)> {
    match &meter.aggregation {
        Aggregation::Count => Ok((None, 1)),
        Aggregation::CountUnique { property } => {
            let value = event.string_property(property).ok_or_else(|| {
                attribution_error(event, format!("property '{property}' missing or not scalar"))
            })?;
            Ok((Some(value), 1))
        }
        Aggregation::Sum { property }
        | Aggregation::SumWithMultiplier { property, .. }
        | Aggregation::Max { property, .. }
        | Aggregation::Latest { property } => {
            let value = event.numeric_property(property).ok_or_else(|| {
                attribution_error(event, format!("property '{property}' missing or not numeric"))
            })?;
            if value < Decimal::ZERO {
                return Err(attribution_error(
                    event,
                    format!("property '{property}' is negative"),
                ));
            }
            let qty = value
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_u64()
                .ok_or_else(|| {
                    attribution_error(event, format!("property '{property}' out of range"))
                })?;
            Ok((Some(value.normalize().to_string()), qty))
        }
    }
}

fn attribution_error(event: &Event, message: String) -> MeteringError {
    MeteringError::AttributionError {
        event_id: event.id.clone(),
        message,
    }
}

fn build_row(
    event: &Event,
    entry: &RoutingEntry,
    processed_at: DateTime<Utc>,
) -> Result<ProcessedEvent> {
    let (agg_field_value, qty) = extract_quantity(&entry.meter, event)?;
    let period_id = PeriodId::from_period_start(period_start_for(
        &entry.subscription,
        &entry.price,
        event.timestamp,
    ));
    let hash = unique_hash(
        Some(&entry.subscription.id),
        Some(&entry.meter.id),
        period_id,
        &event.id,
        agg_field_value.as_deref(),
    );
    // Advisory per-event cost; the read path recomputes charges from the
    // aggregated quantity.
    let cost = pricing::calculate_cost(&entry.price, Decimal::from(qty)).unwrap_or(Decimal::ZERO);

    Ok(ProcessedEvent {
        id: event.id.clone(),
        tenant_id: event.tenant_id.clone(),
        environment_id: event.environment_id.clone(),
        event_name: event.event_name.clone(),
        properties: event.properties.clone(),
        source: event.source.clone(),
        customer_id: Some(entry.customer.id.clone()),
        external_customer_id: Some(entry.customer.external_id.clone()),
        timestamp: event.timestamp,
        ingested_at: event.ingested_at,
        subscription_id: Some(entry.subscription.id.clone()),
        price_id: Some(entry.price.id.clone()),
        feature_id: entry.feature.as_ref().map(|f| f.id.clone()),
        meter_id: Some(entry.meter.id.clone()),
        period_id,
        agg_field_name: entry.meter.aggregation.property().map(str::to_string),
        agg_field_value,
        currency: Some(entry.price.currency.clone()),
        qty_billable: qty,
        cost,
        processed_at,
        status: ProcessedStatus::Processed,
        unique_hash: hash,
    })
}

fn failed_row(event: &Event, entry: &RoutingEntry, processed_at: DateTime<Utc>) -> ProcessedEvent {
    let period_id = PeriodId::from_period_start(period_start_for(
        &entry.subscription,
        &entry.price,
        event.timestamp,
    ));
    ProcessedEvent {
        status: ProcessedStatus::Failed,
        subscription_id: Some(entry.subscription.id.clone()),
        price_id: Some(entry.price.id.clone()),
        feature_id: entry.feature.as_ref().map(|f| f.id.clone()),
        meter_id: Some(entry.meter.id.clone()),
        period_id,
        unique_hash: unique_hash(
            Some(&entry.subscription.id),
            Some(&entry.meter.id),
            period_id,
            &event.id,
            None,
        ),
        ..ProcessedEvent::unattributed(event, processed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prices::{BillingModel, EntityScope, PriceStatus};
    use crate::domain::{
        CustomerId, EnvironmentId, MeterId, PriceId, PropertyFilter, SubscriptionId,
        SubscriptionStatus, TenantId,
    };
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn subscription() -> Subscription {
        Subscription {
            id: SubscriptionId::new("sub_1"),
            tenant_id: TenantId::new("t1"),
            environment_id: EnvironmentId::new("prod"),
            customer_id: CustomerId::new("cust_1"),
            plan_id: "plan".to_string(),
            currency: "USD".to_string(),
            status: SubscriptionStatus::Active,
            start_date: ts(1, 0),
            end_date: None,
            current_period_start: ts(1, 0),
            current_period_end: ts(31, 0),
            billing_anchor: ts(1, 0),
            paused_at: None,
            line_items: vec![],
        }
    }

    fn price() -> Price {
        Price {
            id: PriceId::new("price_1"),
            amount: rust_decimal_macros::dec!(0.01),
            currency: "USD".to_string(),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_model: BillingModel::Flat,
            tier_mode: None,
            tiers: vec![],
            transform: None,
            meter_id: Some(MeterId::new("m1")),
            entity_scope: EntityScope::Plan,
            parent_price_id: None,
            start_date: None,
            end_date: None,
            trial_days: 0,
            commitment: None,
            status: PriceStatus::Published,
        }
    }

    fn meter(aggregation: Aggregation) -> Meter {
        Meter {
            id: MeterId::new("m1"),
            name: "m1".to_string(),
            event_name: "gb_hours".to_string(),
            filters: Vec::<PropertyFilter>::new(),
            aggregation,
        }
    }

    fn event(properties: serde_json::Value, at: DateTime<Utc>) -> Event {
        serde_json::from_value(json!({
            "id": "e1",
            "tenant_id": "t1",
            "environment_id": "prod",
            "event_name": "gb_hours",
            "external_customer_id": "ext_1",
            "timestamp": at,
            "properties": properties,
        }))
        .unwrap()
    }

    #[test]
    fn test_period_walks_forward_from_current_period() {
        let sub = subscription();
        let start = period_start_for(&sub, &price(), ts(1, 5));
        assert_eq!(start, ts(1, 0));
        // 35 days in lands one 30-day period later.
        let later = period_start_for(&sub, &price(), sub.start_date + Duration::days(35));
        assert_eq!(later, ts(31, 0));
    }

    #[test]
    fn test_sum_extraction_rounds_midpoint_away_from_zero() {
        let meter = meter(Aggregation::Sum {
            property: "gb".to_string(),
        });
        let (value, qty) = extract_quantity(&meter, &event(json!({"gb": "2.5"}), ts(2, 0))).unwrap();
        assert_eq!(qty, 3);
        assert_eq!(value.as_deref(), Some("2.5"));
    }

    #[test]
    fn test_missing_property_is_attribution_error() {
        let meter = meter(Aggregation::Sum {
            property: "gb".to_string(),
        });
        let err = extract_quantity(&meter, &event(json!({}), ts(2, 0))).unwrap_err();
        assert!(matches!(err, MeteringError::AttributionError { .. }));
    }

    #[test]
    fn test_count_unique_uses_the_property_value() {
        let meter = meter(Aggregation::CountUnique {
            property: "user".to_string(),
        });
        let (value, qty) =
            extract_quantity(&meter, &event(json!({"user": "u1"}), ts(2, 0))).unwrap();
        assert_eq!(qty, 1);
        assert_eq!(value.as_deref(), Some("u1"));
    }
}
