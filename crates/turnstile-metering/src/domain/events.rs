//! Raw and processed event records.
//!
//! A raw [`Event`] is immutable once ingested; attribution lives only in the
//! [`ProcessedEvent`] rows derived from it. Processed rows are idempotent
//! under their replacing-merge key, with [`unique_hash`] as the deterministic
//! fingerprint that also backs COUNT_UNIQUE aggregation.

use crate::domain::types::{
    CustomerId, EnvironmentId, FeatureId, MeterId, PeriodId, PriceId, SubscriptionId, TenantId,
};
use crate::error::{MeteringError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A raw usage event as emitted by a producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Producer-supplied idempotency key; generated when absent.
    #[serde(default = "Event::generate_id")]
    pub id: String,
    pub tenant_id: TenantId,
    pub environment_id: EnvironmentId,
    pub event_name: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_customer_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the store at write time; absent until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
}

impl Event {
    fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Decode and validate a producer payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let event: Event = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.as_str().is_empty() {
            return Err(MeteringError::ValidationError {
                field: "tenant_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.environment_id.as_str().is_empty() {
            return Err(MeteringError::ValidationError {
                field: "environment_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.event_name.is_empty() {
            return Err(MeteringError::ValidationError {
                field: "event_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        let has_customer = self.customer_id.is_some()
            || self
                .external_customer_id
                .as_deref()
                .is_some_and(|id| !id.is_empty());
        if !has_customer {
            return Err(MeteringError::ValidationError {
                field: "customer_id".to_string(),
                message: "either customer_id or external_customer_id is required".to_string(),
            });
        }
        Ok(())
    }

    /// Numeric value of a property, coercing JSON numbers and numeric strings.
    pub fn numeric_property(&self, name: &str) -> Option<Decimal> {
        match self.properties.get(name)? {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Decimal::from(i))
                } else if let Some(u) = n.as_u64() {
                    Some(Decimal::from(u))
                } else {
                    n.as_f64().and_then(Decimal::from_f64_retain)
                }
            }
            Value::String(s) => s.trim().parse::<Decimal>().ok(),
            _ => None,
        }
    }

    /// String form of a property, used for COUNT_UNIQUE fingerprints and
    /// group-by values.
    pub fn string_property(&self, name: &str) -> Option<String> {
        match self.properties.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Processing status of a materialized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Pending,
    Processed,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Pending => "pending",
            ProcessedStatus::Processed => "processed",
            ProcessedStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => ProcessedStatus::Pending,
            "failed" => ProcessedStatus::Failed,
            _ => ProcessedStatus::Processed,
        }
    }
}

/// A raw event attributed to a billing tuple with a computed billable
/// quantity. Supersedable by a later row carrying the same `unique_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: String,
    pub tenant_id: TenantId,
    pub environment_id: EnvironmentId,
    pub event_name: String,
    pub properties: Map<String, Value>,
    pub source: String,
    pub customer_id: Option<CustomerId>,
    pub external_customer_id: Option<String>,
    /// Event time of the raw event, not its ingestion time.
    pub timestamp: DateTime<Utc>,
    pub ingested_at: Option<DateTime<Utc>>,

    pub subscription_id: Option<SubscriptionId>,
    pub price_id: Option<PriceId>,
    pub feature_id: Option<FeatureId>,
    pub meter_id: Option<MeterId>,
    pub period_id: PeriodId,

    pub agg_field_name: Option<String>,
    pub agg_field_value: Option<String>,
    pub currency: Option<String>,
    pub qty_billable: u64,
    pub cost: Decimal,
    pub processed_at: DateTime<Utc>,
    pub status: ProcessedStatus,
    pub unique_hash: String,
}

impl ProcessedEvent {
    /// An event no routing entry matched: visible in counts, bills nothing.
    pub fn unattributed(event: &Event, processed_at: DateTime<Utc>) -> Self {
        Self {
            id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            environment_id: event.environment_id.clone(),
            event_name: event.event_name.clone(),
            properties: event.properties.clone(),
            source: event.source.clone(),
            customer_id: event.customer_id.clone(),
            external_customer_id: event.external_customer_id.clone(),
            timestamp: event.timestamp,
            ingested_at: event.ingested_at,
            subscription_id: None,
            price_id: None,
            feature_id: None,
            meter_id: None,
            period_id: PeriodId::from_period_start(event.timestamp),
            agg_field_name: None,
            agg_field_value: None,
            currency: None,
            qty_billable: 0,
            cost: Decimal::ZERO,
            processed_at,
            status: ProcessedStatus::Processed,
            unique_hash: unique_hash(None, None, PeriodId::from_period_start(event.timestamp), &event.id, None),
        }
    }
}

/// Deterministic fingerprint of (subscription, meter, period, event id,
/// aggregation field value). Keys the replacing merge and COUNT_UNIQUE.
pub fn unique_hash(
    subscription_id: Option<&SubscriptionId>,
    meter_id: Option<&MeterId>,
    period_id: PeriodId,
    event_id: &str,
    agg_field_value: Option<&str>,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(subscription_id.map(|s| s.as_str()).unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(meter_id.map(|m| m.as_str()).unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(period_id.as_millis().to_be_bytes().as_slice());
    hasher.update(b"|");
    hasher.update(event_id.as_bytes());
    hasher.update(b"|");
    hasher.update(agg_field_value.unwrap_or("").as_bytes());
    hasher.finalize().to_hex().to_string()
}
