//! Meters: declarative rules that turn events into a scalar per billing
//! period, and the features bound to them.

use crate::domain::events::Event;
use crate::domain::types::{FeatureId, MeterId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fixed-size time window used by bucketed aggregations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketWindow {
    Minute,
    FifteenMinutes,
    Hour,
    Day,
}

impl BucketWindow {
    pub fn seconds(&self) -> i64 {
        match self {
            BucketWindow::Minute => 60,
            BucketWindow::FifteenMinutes => 900,
            BucketWindow::Hour => 3_600,
            BucketWindow::Day => 86_400,
        }
    }

    /// Start of the bucket containing `ts_millis`, in epoch millis.
    pub fn bucket_start_millis(&self, ts_millis: i64) -> i64 {
        let size = self.seconds() * 1_000;
        ts_millis.div_euclid(size) * size
    }
}

/// The closed set of aggregation shapes a meter can declare.
///
/// Dispatch over these happens at query-planning time: the variant decides
/// which column of the single aggregation result a line item reads, never a
/// per-event branch on the read path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregation {
    Sum {
        property: String,
    },
    SumWithMultiplier {
        property: String,
        multiplier: Decimal,
    },
    Max {
        property: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucket: Option<BucketWindow>,
    },
    Count,
    CountUnique {
        property: String,
    },
    Latest {
        property: String,
    },
}

impl Aggregation {
    /// The property whose value the materializer extracts, if any.
    pub fn property(&self) -> Option<&str> {
        match self {
            Aggregation::Sum { property }
            | Aggregation::SumWithMultiplier { property, .. }
            | Aggregation::Max { property, .. }
            | Aggregation::CountUnique { property }
            | Aggregation::Latest { property } => Some(property),
            Aggregation::Count => None,
        }
    }

    pub fn bucket(&self) -> Option<BucketWindow> {
        match self {
            Aggregation::Max { bucket, .. } => *bucket,
            _ => None,
        }
    }

    pub fn multiplier(&self) -> Option<Decimal> {
        match self {
            Aggregation::SumWithMultiplier { multiplier, .. } => Some(*multiplier),
            _ => None,
        }
    }
}

/// A single property filter: the event value must be one of `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl PropertyFilter {
    pub fn matches(&self, event: &Event) -> bool {
        let Some(value) = event.properties.get(&self.key) else {
            return false;
        };
        let actual = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return false,
        };
        self.values.iter().any(|v| v == &actual)
    }
}

/// A declarative rule transforming events into a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meter {
    pub id: MeterId,
    pub name: String,
    /// Only events with this name feed the meter.
    pub event_name: String,
    /// All filters must match (conjunction); an empty list matches every
    /// event carrying the meter's event name.
    #[serde(default)]
    pub filters: Vec<PropertyFilter>,
    pub aggregation: Aggregation,
}

impl Meter {
    pub fn matches(&self, event: &Event) -> bool {
        self.event_name == event.event_name && self.filters.iter().all(|f| f.matches(event))
    }
}

/// A user-facing entitlement bound to a meter; the group-by key during
/// aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub meter_id: MeterId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn api_call(properties: serde_json::Value) -> Event {
        serde_json::from_value(json!({
            "id": "e1",
            "tenant_id": "t1",
            "environment_id": "prod",
            "event_name": "api_call",
            "external_customer_id": "c1",
            "timestamp": Utc::now(),
            "properties": properties,
        }))
        .unwrap()
    }

    #[test]
    fn test_filter_matches_string_and_number_values() {
        let filter = PropertyFilter {
            key: "region".to_string(),
            values: vec!["eu-west".to_string(), "us-east".to_string()],
        };
        assert!(filter.matches(&api_call(json!({"region": "eu-west"}))));
        assert!(!filter.matches(&api_call(json!({"region": "ap-south"}))));
        assert!(!filter.matches(&api_call(json!({}))));

        let numeric = PropertyFilter {
            key: "status".to_string(),
            values: vec!["200".to_string()],
        };
        assert!(numeric.matches(&api_call(json!({"status": 200}))));
    }

    #[test]
    fn test_meter_requires_event_name_and_all_filters() {
        let meter = Meter {
            id: MeterId::new("m1"),
            name: "EU API calls".to_string(),
            event_name: "api_call".to_string(),
            filters: vec![
                PropertyFilter {
                    key: "region".to_string(),
                    values: vec!["eu-west".to_string()],
                },
                PropertyFilter {
                    key: "tier".to_string(),
                    values: vec!["paid".to_string()],
                },
            ],
            aggregation: Aggregation::Count,
        };

        assert!(meter.matches(&api_call(json!({"region": "eu-west", "tier": "paid"}))));
        assert!(!meter.matches(&api_call(json!({"region": "eu-west"}))));

        let mut other = api_call(json!({"region": "eu-west", "tier": "paid"}));
        other.event_name = "gb_hours".to_string();
        assert!(!meter.matches(&other));
    }

    #[test]
    fn test_bucket_start_alignment() {
        let w = BucketWindow::FifteenMinutes;
        // 2026-01-01T00:20:00Z falls into the 00:15 bucket.
        let ts = 1_767_225_600_000i64 + 20 * 60 * 1_000;
        assert_eq!(w.bucket_start_millis(ts), 1_767_225_600_000 + 15 * 60 * 1_000);
    }
}
