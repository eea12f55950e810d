//! Subscriptions, their line items, and the customers they bill.

use crate::domain::types::{CustomerId, EnvironmentId, MeterId, PriceId, SubscriptionId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Paused,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn is_billable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

/// A customer identity: internal id plus the external id producers use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub external_id: String,
    pub name: String,
}

/// One price bound to a subscription, with the meter derived from the price
/// when it is usage-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    pub subscription_id: SubscriptionId,
    pub price_id: PriceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<MeterId>,
    pub quantity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_until: Option<DateTime<Utc>>,
}

impl LineItem {
    pub fn is_usage_based(&self) -> bool {
        self.meter_id.is_some()
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        if self.active_from.is_some_and(|from| at < from) {
            return false;
        }
        if self.active_until.is_some_and(|until| at >= until) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub environment_id: EnvironmentId,
    pub customer_id: CustomerId,
    pub plan_id: String,
    pub currency: String,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// Day-of-period anchor the period boundaries were derived from.
    pub billing_anchor: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    pub line_items: Vec<LineItem>,
}

impl Subscription {
    /// Clamp a requested half-open window to the subscription's lifetime and
    /// its current billing period. `None` bounds mean lifetime usage, which
    /// starts at the subscription start.
    pub fn clamp_period(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let mut t0 = start.unwrap_or(self.start_date).max(self.start_date);
        let mut t1 = end.unwrap_or(self.current_period_end);
        if let Some(end_date) = self.end_date {
            t1 = t1.min(end_date);
        }
        t1 = t1.min(self.current_period_end);
        if let Some(paused_at) = self.paused_at {
            t1 = t1.min(paused_at);
        }
        if t0 > t1 {
            t0 = t1;
        }
        (t0, t1)
    }
}
