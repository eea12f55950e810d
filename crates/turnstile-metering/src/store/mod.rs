//! Columnar event store: append-only `events` and `events_processed` tables
//! plus the single-scan aggregation the billing read path runs against them.

pub mod clickhouse;
pub mod memory;

use crate::config::ReadSource;
use crate::domain::{
    BucketWindow, CustomerId, EnvironmentId, Event, FeatureId, ProcessedEvent, SubscriptionId,
    TenantId,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

pub use clickhouse::ClickHouseStore;
pub use memory::MemoryEventStore;

/// A (tenant, environment) slice of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    pub tenant_id: TenantId,
    pub environment_id: EnvironmentId,
}

/// Which time column a raw-event scan filters on. Live materialization
/// follows ingestion time (late arrivals included); reprocessing follows
/// event time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTimeColumn {
    IngestedAt,
    EventTime,
}

/// Parameters of the one aggregation query a usage read issues.
#[derive(Debug, Clone)]
pub struct UsageQuery {
    pub scope: EventScope,
    pub subscription_id: SubscriptionId,
    pub customer_id: Option<CustomerId>,
    pub external_customer_id: Option<String>,
    /// Half-open window [start, end).
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub source: ReadSource,
    /// Distinct bucket windows requested by bucketed-max meters, so the one
    /// scan can compute per-bucket maxima for each of them.
    pub bucket_windows: Vec<BucketWindow>,
}

/// Aggregates for one feature, every column of the single scan.
///
/// Which column a line item reads is decided by its meter's aggregation
/// variant at query-planning time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureUsage {
    pub sum_total: Decimal,
    pub max_total: Decimal,
    pub count_distinct_ids: u64,
    pub count_distinct_unique_hash: u64,
    /// argMax(qty_billable, timestamp): the quantity of the latest event.
    pub latest_qty: Decimal,
    /// Sum of per-bucket maxima, per requested window.
    pub bucketed_max: HashMap<BucketWindow, Decimal>,
}

/// Row counts and bounds for operability checks.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub raw_count: u64,
    pub processed_count: u64,
    pub oldest_event: Option<DateTime<Utc>>,
    pub newest_event: Option<DateTime<Utc>>,
}

/// A payload that failed decoding or validation, kept for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: String,
    pub source: String,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomic bulk append of raw events; on failure nothing becomes visible.
    /// Assigns `ingested_at` to every row it writes.
    async fn insert_events(&self, events: &[Event]) -> Result<()>;

    /// Bulk append of processed rows. The table's replacing-merge key makes
    /// re-materialization of the same rows a no-op at read time.
    async fn insert_processed(&self, rows: &[ProcessedEvent]) -> Result<()>;

    /// The single grouped scan behind a usage read. Never one query per
    /// meter.
    async fn aggregate_usage(&self, query: &UsageQuery)
        -> Result<HashMap<FeatureId, FeatureUsage>>;

    /// Event names that have ever fired in the scope, for query planning.
    async fn distinct_event_names(&self, scope: &EventScope) -> Result<Vec<String>>;

    /// Raw events whose chosen time column falls in [start, end);
    /// materializer input.
    async fn fetch_raw_events(
        &self,
        scope: &EventScope,
        by: RawTimeColumn,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>>;

    /// Reprocessing fence: delete processed rows in the scope and event-time
    /// range whose `processed_at` predates `fence`. Rows written after the
    /// fence (for example by a concurrent live materializer) survive.
    async fn delete_processed_before(
        &self,
        scope: &EventScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        fence: DateTime<Utc>,
    ) -> Result<u64>;

    /// Retention sweep over raw events older than `cutoff`.
    async fn purge_raw_events_before(
        &self,
        scope: &EventScope,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// Dead-letter sink for undecodable payloads.
    async fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<()>;

    async fn statistics(&self, scope: &EventScope) -> Result<StoreStatistics>;
}
