//! In-memory store with the same semantics as the ClickHouse backend,
//! including replace-by-latest merge on processed rows. Used by tests and
//! local development; also the reference implementation of the aggregation
//! expressions.

use super::{
    DeadLetter, EventScope, EventStore, FeatureUsage, RawTimeColumn, StoreStatistics, UsageQuery,
};
use crate::domain::{Event, FeatureId, PeriodId, ProcessedEvent, ProcessedStatus};
use crate::error::{MeteringError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Replacing-merge key of `events_processed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProcessedKey {
    tenant_id: String,
    environment_id: String,
    subscription_id: String,
    meter_id: String,
    period_id: PeriodId,
    timestamp: DateTime<Utc>,
    id: String,
}

impl ProcessedKey {
    fn of(row: &ProcessedEvent) -> Self {
        Self {
            tenant_id: row.tenant_id.to_string(),
            environment_id: row.environment_id.to_string(),
            subscription_id: row
                .subscription_id
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            meter_id: row.meter_id.as_ref().map(|m| m.to_string()).unwrap_or_default(),
            period_id: row.period_id,
            timestamp: row.timestamp,
            id: row.id.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    raw: Vec<Event>,
    processed: HashMap<ProcessedKey, ProcessedEvent>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
    raw_batches: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every bulk insert fail until cleared; simulates a store outage.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn raw_events(&self) -> Vec<Event> {
        self.inner.read().await.raw.clone()
    }

    /// How many raw bulk inserts have landed.
    pub fn raw_batch_count(&self) -> usize {
        self.raw_batches.load(Ordering::SeqCst)
    }

    pub async fn processed_rows(&self) -> Vec<ProcessedEvent> {
        self.inner.read().await.processed.values().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.read().await.dead_letters.clone()
    }

    fn write_error(&self, operation: &str) -> MeteringError {
        MeteringError::StoreError {
            operation: operation.to_string(),
            source: "simulated store outage".into(),
        }
    }

    fn scope_matches(scope: &EventScope, tenant: &str, environment: &str) -> bool {
        scope.tenant_id.as_str() == tenant && scope.environment_id.as_str() == environment
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_events(&self, events: &[Event]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.write_error("insert_events"));
        }
        let ingested_at = Utc::now();
        let mut inner = self.inner.write().await;
        for event in events {
            let mut event = event.clone();
            event.ingested_at = Some(ingested_at);
            inner.raw.push(event);
        }
        self.raw_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_processed(&self, rows: &[ProcessedEvent]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(self.write_error("insert_processed"));
        }
        let ingested_at = Utc::now();
        let mut inner = self.inner.write().await;
        for row in rows {
            // Later write wins, as the replacing merge resolves by latest
            // ingestion.
            let mut row = row.clone();
            row.ingested_at = Some(ingested_at);
            inner.processed.insert(ProcessedKey::of(&row), row);
        }
        Ok(())
    }

    async fn aggregate_usage(
        &self,
        query: &UsageQuery,
    ) -> Result<HashMap<FeatureId, FeatureUsage>> {
        let inner = self.inner.read().await;

        let mut by_feature: HashMap<FeatureId, Vec<&ProcessedEvent>> = HashMap::new();
        for row in inner.processed.values() {
            if row.status != ProcessedStatus::Processed {
                continue;
            }
            if !Self::scope_matches(
                &query.scope,
                row.tenant_id.as_str(),
                row.environment_id.as_str(),
            ) {
                continue;
            }
            if row.subscription_id.as_ref() != Some(&query.subscription_id) {
                continue;
            }
            if let Some(customer_id) = &query.customer_id {
                if row.customer_id.as_ref() != Some(customer_id) {
                    continue;
                }
            } else if let Some(external) = &query.external_customer_id {
                if row.external_customer_id.as_deref() != Some(external.as_str()) {
                    continue;
                }
            }
            if row.timestamp < query.start || row.timestamp >= query.end {
                continue;
            }
            let Some(feature_id) = &row.feature_id else {
                continue;
            };
            by_feature.entry(feature_id.clone()).or_default().push(row);
        }

        let mut result = HashMap::new();
        for (feature_id, rows) in by_feature {
            // anyLast(qty_billable) per id: replays of the same raw event
            // collapse to a single quantity before any aggregate sees them.
            let mut qty_by_id: HashMap<&str, (u64, DateTime<Utc>)> = HashMap::new();
            let mut hashes: HashSet<&str> = HashSet::new();
            for row in &rows {
                qty_by_id.insert(row.id.as_str(), (row.qty_billable, row.timestamp));
                hashes.insert(row.unique_hash.as_str());
            }

            let mut usage = FeatureUsage {
                count_distinct_ids: qty_by_id.len() as u64,
                count_distinct_unique_hash: hashes.len() as u64,
                ..Default::default()
            };

            let mut latest: Option<(DateTime<Utc>, u64)> = None;
            for (qty, ts) in qty_by_id.values() {
                usage.sum_total += Decimal::from(*qty);
                usage.max_total = usage.max_total.max(Decimal::from(*qty));
                if latest.map_or(true, |(best, _)| *ts >= best) {
                    latest = Some((*ts, *qty));
                }
            }
            usage.latest_qty = latest.map(|(_, qty)| Decimal::from(qty)).unwrap_or_default();

            for window in &query.bucket_windows {
                let mut bucket_max: HashMap<i64, u64> = HashMap::new();
                for (qty, ts) in qty_by_id.values() {
                    let bucket = window.bucket_start_millis(ts.timestamp_millis());
                    let entry = bucket_max.entry(bucket).or_default();
                    *entry = (*entry).max(*qty);
                }
                let total: u64 = bucket_max.values().sum();
                usage.bucketed_max.insert(*window, Decimal::from(total));
            }

            result.insert(feature_id, usage);
        }

        Ok(result)
    }

    async fn distinct_event_names(&self, scope: &EventScope) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut names: HashSet<String> = HashSet::new();
        for event in &inner.raw {
            if Self::scope_matches(scope, event.tenant_id.as_str(), event.environment_id.as_str())
            {
                names.insert(event.event_name.clone());
            }
        }
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        Ok(names)
    }

    async fn fetch_raw_events(
        &self,
        scope: &EventScope,
        by: RawTimeColumn,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let inner = self.inner.read().await;
        Ok(inner
            .raw
            .iter()
            .filter(|e| {
                let at = match by {
                    RawTimeColumn::IngestedAt => e.ingested_at,
                    RawTimeColumn::EventTime => Some(e.timestamp),
                };
                Self::scope_matches(scope, e.tenant_id.as_str(), e.environment_id.as_str())
                    && at.is_some_and(|at| at >= start && at < end)
            })
            .cloned()
            .collect())
    }

    async fn delete_processed_before(
        &self,
        scope: &EventScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        fence: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.processed.len();
        inner.processed.retain(|_, row| {
            !(Self::scope_matches(scope, row.tenant_id.as_str(), row.environment_id.as_str())
                && row.timestamp >= start
                && row.timestamp < end
                && row.processed_at < fence)
        });
        Ok((before - inner.processed.len()) as u64)
    }

    async fn purge_raw_events_before(
        &self,
        scope: &EventScope,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.raw.len();
        inner.raw.retain(|e| {
            !(Self::scope_matches(scope, e.tenant_id.as_str(), e.environment_id.as_str())
                && e.timestamp < cutoff)
        });
        Ok((before - inner.raw.len()) as u64)
    }

    async fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.dead_letters.extend_from_slice(letters);
        Ok(())
    }

    async fn statistics(&self, scope: &EventScope) -> Result<StoreStatistics> {
        let inner = self.inner.read().await;
        let mut stats = StoreStatistics::default();
        for event in &inner.raw {
            if !Self::scope_matches(scope, event.tenant_id.as_str(), event.environment_id.as_str())
            {
                continue;
            }
            stats.raw_count += 1;
            stats.oldest_event = Some(match stats.oldest_event {
                Some(oldest) => oldest.min(event.timestamp),
                None => event.timestamp,
            });
            stats.newest_event = Some(match stats.newest_event {
                Some(newest) => newest.max(event.timestamp),
                None => event.timestamp,
            });
        }
        stats.processed_count = inner
            .processed
            .values()
            .filter(|row| {
                Self::scope_matches(scope, row.tenant_id.as_str(), row.environment_id.as_str())
            })
            .count() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadSource;
    use crate::domain::{unique_hash, MeterId, SubscriptionId, TenantId};
    use crate::domain::{BucketWindow, EnvironmentId};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn scope() -> EventScope {
        EventScope {
            tenant_id: TenantId::new("t1"),
            environment_id: EnvironmentId::new("prod"),
        }
    }

    fn ts(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, minute, second).unwrap()
    }

    fn processed(id: &str, qty: u64, at: DateTime<Utc>, hash_value: &str) -> ProcessedEvent {
        let subscription = SubscriptionId::new("sub_1");
        let meter = MeterId::new("m1");
        let period = PeriodId::from_period_start(ts(0, 0));
        ProcessedEvent {
            id: id.to_string(),
            tenant_id: TenantId::new("t1"),
            environment_id: EnvironmentId::new("prod"),
            event_name: "api_call".to_string(),
            properties: Default::default(),
            source: "test".to_string(),
            customer_id: None,
            external_customer_id: Some("c1".to_string()),
            timestamp: at,
            ingested_at: Some(at),
            subscription_id: Some(subscription.clone()),
            price_id: None,
            feature_id: Some(FeatureId::new("f1")),
            meter_id: Some(meter.clone()),
            period_id: period,
            agg_field_name: None,
            agg_field_value: Some(hash_value.to_string()),
            currency: Some("USD".to_string()),
            qty_billable: qty,
            cost: Decimal::ZERO,
            processed_at: at,
            status: ProcessedStatus::Processed,
            unique_hash: unique_hash(Some(&subscription), Some(&meter), period, id, Some(hash_value)),
        }
    }

    fn query(windows: Vec<BucketWindow>) -> UsageQuery {
        UsageQuery {
            scope: scope(),
            subscription_id: SubscriptionId::new("sub_1"),
            customer_id: None,
            external_customer_id: Some("c1".to_string()),
            start: ts(0, 0),
            end: ts(59, 59),
            source: ReadSource::Live,
            bucket_windows: windows,
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_collapses_per_id() {
        let store = MemoryEventStore::new();
        let row = processed("e1", 5, ts(1, 0), "u1");
        store
            .insert_processed(&[row.clone(), row.clone(), row])
            .await
            .unwrap();

        let usage = store.aggregate_usage(&query(vec![])).await.unwrap();
        let feature = &usage[&FeatureId::new("f1")];
        assert_eq!(feature.sum_total, Decimal::from(5));
        assert_eq!(feature.count_distinct_ids, 1);
        assert_eq!(feature.count_distinct_unique_hash, 1);
    }

    #[tokio::test]
    async fn test_count_unique_tracks_field_values_not_events() {
        let store = MemoryEventStore::new();
        store
            .insert_processed(&[
                processed("e1", 1, ts(1, 0), "u1"),
                processed("e2", 1, ts(2, 0), "u1"),
                processed("e3", 1, ts(3, 0), "u2"),
            ])
            .await
            .unwrap();

        let usage = store.aggregate_usage(&query(vec![])).await.unwrap();
        let feature = &usage[&FeatureId::new("f1")];
        assert_eq!(feature.count_distinct_ids, 3);
        assert_eq!(feature.count_distinct_unique_hash, 2);
    }

    #[tokio::test]
    async fn test_latest_is_by_event_timestamp_not_arrival() {
        let store = MemoryEventStore::new();
        // Arrival order t=1, t=3, t=2; LATEST must read the t=3 row.
        store
            .insert_processed(&[
                processed("e1", 5, ts(1, 0), "a"),
                processed("e2", 2, ts(3, 0), "b"),
                processed("e3", 9, ts(2, 0), "c"),
            ])
            .await
            .unwrap();

        let usage = store.aggregate_usage(&query(vec![])).await.unwrap();
        let feature = &usage[&FeatureId::new("f1")];
        assert_eq!(feature.latest_qty, Decimal::from(2));
        assert_eq!(feature.max_total, Decimal::from(9));
    }

    #[tokio::test]
    async fn test_bucketed_max_sums_per_bucket_maxima() {
        let store = MemoryEventStore::new();
        // Two events in the 12:00 minute bucket (max 7), one in 12:05 (4).
        store
            .insert_processed(&[
                processed("e1", 3, ts(0, 10), "a"),
                processed("e2", 7, ts(0, 40), "b"),
                processed("e3", 4, ts(5, 0), "c"),
            ])
            .await
            .unwrap();

        let usage = store
            .aggregate_usage(&query(vec![BucketWindow::Minute]))
            .await
            .unwrap();
        let feature = &usage[&FeatureId::new("f1")];
        assert_eq!(feature.bucketed_max[&BucketWindow::Minute], Decimal::from(11));
    }

    #[tokio::test]
    async fn test_reprocessing_fence_preserves_new_rows() {
        let store = MemoryEventStore::new();
        let mut stale = processed("e1", 5, ts(1, 0), "a");
        stale.processed_at = ts(10, 0);
        let mut fresh = processed("e2", 5, ts(2, 0), "b");
        fresh.processed_at = ts(30, 0);
        store.insert_processed(&[stale, fresh]).await.unwrap();

        let deleted = store
            .delete_processed_before(&scope(), ts(0, 0), ts(59, 0), ts(20, 0))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let remaining = store.processed_rows().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "e2");
    }

    #[tokio::test]
    async fn test_write_failure_leaves_no_partial_state() {
        let store = MemoryEventStore::new();
        store.set_fail_writes(true);
        let err = store
            .insert_processed(&[processed("e1", 5, ts(1, 0), "a")])
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.processed_rows().await.is_empty());
    }
}
