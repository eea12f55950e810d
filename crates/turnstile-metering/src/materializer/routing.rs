//! Per-event routing: which (meter, price, subscription, feature) tuple an
//! event bills against.
//!
//! Built once per materialization pass from the catalog snapshot and keyed by
//! event name. Entries are ordered by price id, a stable priority; the first
//! entry whose filter group matches wins.

use super::catalog::CatalogSnapshot;
use crate::domain::prices::PriceStatus;
use crate::domain::{Customer, Event, Feature, Meter, Price, Subscription};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RoutingEntry {
    pub subscription: Subscription,
    pub customer: Customer,
    pub price: Price,
    pub meter: Meter,
    pub feature: Option<Feature>,
}

impl RoutingEntry {
    fn customer_matches(&self, event: &Event) -> bool {
        if let Some(customer_id) = &event.customer_id {
            return customer_id == &self.customer.id;
        }
        event
            .external_customer_id
            .as_deref()
            .is_some_and(|external| external == self.customer.external_id)
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.customer_matches(event) && self.meter.matches(event)
    }
}

/// Routing entries for one (tenant, environment) scope, keyed by event name.
pub struct RoutingTable {
    entries: HashMap<String, Vec<RoutingEntry>>,
}

impl RoutingTable {
    /// Assemble routing entries from every billable subscription's usage
    /// line items. Prices that are unusable or structurally invalid are left
    /// out; billing them is the read path's problem, attribution must not
    /// guess.
    pub fn build(snapshot: &CatalogSnapshot, now: DateTime<Utc>) -> Self {
        let mut entries: HashMap<String, Vec<RoutingEntry>> = HashMap::new();

        for subscription in &snapshot.subscriptions {
            if !subscription.status.is_billable() {
                continue;
            }
            let Some(customer) = snapshot.customer(&subscription.customer_id) else {
                debug!(
                    subscription = %subscription.id,
                    customer = %subscription.customer_id,
                    "Skipping subscription without a customer record"
                );
                continue;
            };

            for item in &subscription.line_items {
                if !item.is_active_at(now) {
                    continue;
                }
                let Some(price) = snapshot.price(&item.price_id) else {
                    continue;
                };
                if price.status != PriceStatus::Published || !price.is_usable(now) {
                    continue;
                }
                let Some(meter_id) = price.meter_id.as_ref().or(item.meter_id.as_ref()) else {
                    continue;
                };
                let Some(meter) = snapshot.meter(meter_id) else {
                    continue;
                };
                if price.validate().is_err() {
                    continue;
                }

                let feature = snapshot.feature_for_meter(&meter.id).cloned();
                entries
                    .entry(meter.event_name.clone())
                    .or_default()
                    .push(RoutingEntry {
                        subscription: subscription.clone(),
                        customer: customer.clone(),
                        price: price.clone(),
                        meter: meter.clone(),
                        feature,
                    });
            }
        }

        for bucket in entries.values_mut() {
            bucket.sort_by(|a, b| a.price.id.cmp(&b.price.id));
        }

        Self { entries }
    }

    /// First matching entry in priority order, if any.
    pub fn route(&self, event: &Event) -> Option<&RoutingEntry> {
        self.entries
            .get(&event.event_name)?
            .iter()
            .find(|entry| entry.matches(event))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
