//! ClickHouse-backed event store.
//!
//! `events` is a plain MergeTree ordered by the natural clustering key;
//! `events_processed` is a ReplacingMergeTree versioned by `ingested_at`, so
//! re-materializing the same rows is safe and `FINAL` reads collapse
//! duplicates. The usage aggregation is one scan: an inner per-id collapse
//! (`anyLast`) so replayed events never double-count, then one GROUP BY
//! feature with every aggregate the read path can ask for.

use super::{
    DeadLetter, EventScope, EventStore, FeatureUsage, RawTimeColumn, StoreStatistics, UsageQuery,
};
use crate::config::{ReadSource, StoreConfig};
use crate::domain::{
    BucketWindow, CustomerId, EnvironmentId, Event, FeatureId, ProcessedEvent, TenantId,
};
use crate::error::{MeteringError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::info;

const EVENTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id String,
    tenant_id LowCardinality(String),
    environment_id LowCardinality(String),
    event_name LowCardinality(String),
    properties String,
    source LowCardinality(String),
    customer_id String,
    external_customer_id String,
    timestamp DateTime64(3, 'UTC'),
    ingested_at DateTime64(3, 'UTC')
) ENGINE = MergeTree()
PARTITION BY toYYYYMM(timestamp)
ORDER BY (tenant_id, environment_id, event_name, external_customer_id, timestamp, id)
"#;

const EVENTS_PROCESSED_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events_processed (
    id String,
    tenant_id LowCardinality(String),
    environment_id LowCardinality(String),
    event_name LowCardinality(String),
    properties String,
    source LowCardinality(String),
    customer_id String,
    external_customer_id String,
    timestamp DateTime64(3, 'UTC'),
    ingested_at DateTime64(3, 'UTC'),
    subscription_id String,
    price_id String,
    feature_id String,
    meter_id String,
    period_id UInt64,
    agg_field_name String,
    agg_field_value String,
    currency LowCardinality(String),
    qty_billable UInt64,
    cost String,
    processed_at DateTime64(3, 'UTC'),
    status LowCardinality(String),
    unique_hash String
) ENGINE = ReplacingMergeTree(ingested_at)
PARTITION BY toYYYYMM(timestamp)
ORDER BY (tenant_id, environment_id, subscription_id, meter_id, period_id, timestamp, id)
"#;

const DEAD_LETTERS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events_dead_letter (
    payload String,
    reason String,
    source LowCardinality(String),
    received_at DateTime64(3, 'UTC')
) ENGINE = MergeTree()
ORDER BY received_at
"#;

#[derive(Debug, Row, Serialize, Deserialize)]
struct EventRow {
    id: String,
    tenant_id: String,
    environment_id: String,
    event_name: String,
    properties: String,
    source: String,
    customer_id: String,
    external_customer_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    timestamp: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ingested_at: DateTime<Utc>,
}

impl EventRow {
    fn from_event(event: &Event, ingested_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            tenant_id: event.tenant_id.to_string(),
            environment_id: event.environment_id.to_string(),
            event_name: event.event_name.clone(),
            properties: serde_json::to_string(&event.properties)?,
            source: event.source.clone(),
            customer_id: event
                .customer_id
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            external_customer_id: event.external_customer_id.clone().unwrap_or_default(),
            timestamp: event.timestamp,
            ingested_at,
        })
    }

    fn into_event(self) -> Event {
        Event {
            id: self.id,
            tenant_id: TenantId::new(self.tenant_id),
            environment_id: EnvironmentId::new(self.environment_id),
            event_name: self.event_name,
            properties: serde_json::from_str(&self.properties).unwrap_or_default(),
            source: self.source,
            customer_id: (!self.customer_id.is_empty()).then(|| CustomerId::new(self.customer_id)),
            external_customer_id: (!self.external_customer_id.is_empty())
                .then_some(self.external_customer_id),
            timestamp: self.timestamp,
            ingested_at: Some(self.ingested_at),
        }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
struct ProcessedEventRow {
    id: String,
    tenant_id: String,
    environment_id: String,
    event_name: String,
    properties: String,
    source: String,
    customer_id: String,
    external_customer_id: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    timestamp: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    ingested_at: DateTime<Utc>,
    subscription_id: String,
    price_id: String,
    feature_id: String,
    meter_id: String,
    period_id: u64,
    agg_field_name: String,
    agg_field_value: String,
    currency: String,
    qty_billable: u64,
    cost: String,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    processed_at: DateTime<Utc>,
    status: String,
    unique_hash: String,
}

impl ProcessedEventRow {
    fn from_processed(row: &ProcessedEvent, ingested_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            id: row.id.clone(),
            tenant_id: row.tenant_id.to_string(),
            environment_id: row.environment_id.to_string(),
            event_name: row.event_name.clone(),
            properties: serde_json::to_string(&row.properties)?,
            source: row.source.clone(),
            customer_id: row
                .customer_id
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            external_customer_id: row.external_customer_id.clone().unwrap_or_default(),
            timestamp: row.timestamp,
            ingested_at,
            subscription_id: row
                .subscription_id
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_default(),
            price_id: row.price_id.as_ref().map(|p| p.to_string()).unwrap_or_default(),
            feature_id: row
                .feature_id
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default(),
            meter_id: row.meter_id.as_ref().map(|m| m.to_string()).unwrap_or_default(),
            period_id: row.period_id.as_millis(),
            agg_field_name: row.agg_field_name.clone().unwrap_or_default(),
            agg_field_value: row.agg_field_value.clone().unwrap_or_default(),
            currency: row.currency.clone().unwrap_or_default(),
            qty_billable: row.qty_billable,
            cost: row.cost.to_string(),
            processed_at: row.processed_at,
            status: row.status.as_str().to_string(),
            unique_hash: row.unique_hash.clone(),
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct UsageRow {
    feature_id: String,
    sum_total: u64,
    max_total: u64,
    count_distinct_ids: u64,
    count_distinct_unique_hash: u64,
    latest_qty: u64,
    bucketed_max_minute: u64,
    bucketed_max_fifteen_minutes: u64,
    bucketed_max_hour: u64,
    bucketed_max_day: u64,
}

impl UsageRow {
    fn bucketed(&self, window: BucketWindow) -> u64 {
        match window {
            BucketWindow::Minute => self.bucketed_max_minute,
            BucketWindow::FifteenMinutes => self.bucketed_max_fifteen_minutes,
            BucketWindow::Hour => self.bucketed_max_hour,
            BucketWindow::Day => self.bucketed_max_day,
        }
    }
}

#[derive(Debug, Row, Deserialize)]
struct NameRow {
    event_name: String,
}

#[derive(Debug, Row, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct StatisticsRow {
    raw_count: u64,
    oldest_millis: i64,
    newest_millis: i64,
}

/// ClickHouse client wrapper carrying the per-call deadlines.
pub struct ClickHouseStore {
    client: Client,
    write_timeout: Duration,
    query_deadline: Duration,
}

impl ClickHouseStore {
    pub fn new(config: &StoreConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user)
            .with_password(&config.password)
            .with_database(&config.database);
        Self {
            client,
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            query_deadline: Duration::from_millis(config.query_deadline_ms),
        }
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in [EVENTS_DDL, EVENTS_PROCESSED_DDL, DEAD_LETTERS_DDL] {
            self.with_deadline("ensure_schema", self.query_deadline, async {
                self.client.query(ddl).execute().await
            })
            .await?;
        }
        info!("Store schema is in place");
        Ok(())
    }

    async fn with_deadline<T, F>(&self, operation: &str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, clickhouse::error::Error>>,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(MeteringError::StoreError {
                operation: operation.to_string(),
                source: Box::new(e),
            }),
            Err(_) => Err(MeteringError::Timeout {
                operation: operation.to_string(),
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    fn usage_sql(query: &UsageQuery) -> String {
        let final_clause = match query.source {
            ReadSource::Live => "",
            ReadSource::InvoiceCreation => " FINAL",
        };
        let customer_predicate = if query.customer_id.is_some() {
            "customer_id = ?"
        } else {
            "external_customer_id = ?"
        };

        // Each id contributes one quantity (anyLast) and one bucket per
        // window, derived from its event timestamp; the outer level folds
        // per-bucket maxima with maxMap.
        let mut bucket_inner = String::new();
        let mut bucket_outer = String::new();
        for (name, window) in [
            ("minute", BucketWindow::Minute),
            ("fifteen_minutes", BucketWindow::FifteenMinutes),
            ("hour", BucketWindow::Hour),
            ("day", BucketWindow::Day),
        ] {
            let size_millis = window.seconds() * 1_000;
            bucket_inner.push_str(&format!(
                ",\n        intDiv(toUnixTimestamp64Milli(max(timestamp)), {size}) * {size} AS bucket_{name}",
                size = size_millis,
                name = name,
            ));
            bucket_outer.push_str(&format!(
                ",\n    arraySum(mapValues(maxMap(map(bucket_{name}, qty)))) AS bucketed_max_{name}",
                name = name,
            ));
        }

        format!(
            r#"
SELECT
    feature_id,
    sum(qty) AS sum_total,
    max(qty) AS max_total,
    uniqExact(id) AS count_distinct_ids,
    uniqExact(unique_hash) AS count_distinct_unique_hash,
    argMax(qty, ts) AS latest_qty{bucket_outer}
FROM (
    SELECT
        feature_id,
        id,
        anyLast(unique_hash) AS unique_hash,
        anyLast(qty_billable) AS qty,
        max(timestamp) AS ts{bucket_inner}
    FROM events_processed{final_clause}
    WHERE tenant_id = ?
      AND environment_id = ?
      AND subscription_id = ?
      AND {customer_predicate}
      AND status = 'processed'
      AND feature_id != ''
      AND timestamp >= fromUnixTimestamp64Milli(?)
      AND timestamp < fromUnixTimestamp64Milli(?)
    GROUP BY feature_id, id
)
GROUP BY feature_id
"#,
        )
    }
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn insert_events(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let ingested_at = Utc::now();
        let rows = events
            .iter()
            .map(|e| EventRow::from_event(e, ingested_at))
            .collect::<Result<Vec<_>>>()?;

        self.with_deadline("insert_events", self.write_timeout, async {
            let mut insert = self.client.insert("events")?;
            for row in &rows {
                insert.write(row).await?;
            }
            insert.end().await
        })
        .await
    }

    async fn insert_processed(&self, rows: &[ProcessedEvent]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        // The replacing merge versions on ingested_at; stamping it here makes
        // the newest materialization win.
        let ingested_at = Utc::now();
        let rows = rows
            .iter()
            .map(|r| ProcessedEventRow::from_processed(r, ingested_at))
            .collect::<Result<Vec<_>>>()?;

        self.with_deadline("insert_processed", self.write_timeout, async {
            let mut insert = self.client.insert("events_processed")?;
            for row in &rows {
                insert.write(row).await?;
            }
            insert.end().await
        })
        .await
    }

    async fn aggregate_usage(
        &self,
        query: &UsageQuery,
    ) -> Result<HashMap<FeatureId, FeatureUsage>> {
        let sql = Self::usage_sql(query);
        let customer = query
            .customer_id
            .as_ref()
            .map(|c| c.to_string())
            .or_else(|| query.external_customer_id.clone())
            .unwrap_or_default();

        let rows = self
            .with_deadline("aggregate_usage", self.query_deadline, async {
                self.client
                    .query(&sql)
                    .bind(query.scope.tenant_id.as_str())
                    .bind(query.scope.environment_id.as_str())
                    .bind(query.subscription_id.as_str())
                    .bind(customer.as_str())
                    .bind(query.start.timestamp_millis())
                    .bind(query.end.timestamp_millis())
                    .fetch_all::<UsageRow>()
                    .await
            })
            .await?;

        let mut result = HashMap::with_capacity(rows.len());
        for row in rows {
            let mut usage = FeatureUsage {
                sum_total: Decimal::from(row.sum_total),
                max_total: Decimal::from(row.max_total),
                count_distinct_ids: row.count_distinct_ids,
                count_distinct_unique_hash: row.count_distinct_unique_hash,
                latest_qty: Decimal::from(row.latest_qty),
                bucketed_max: HashMap::new(),
            };
            for window in &query.bucket_windows {
                usage
                    .bucketed_max
                    .insert(*window, Decimal::from(row.bucketed(*window)));
            }
            result.insert(FeatureId::new(row.feature_id.clone()), usage);
        }
        Ok(result)
    }

    async fn distinct_event_names(&self, scope: &EventScope) -> Result<Vec<String>> {
        let rows = self
            .with_deadline("distinct_event_names", self.query_deadline, async {
                self.client
                    .query(
                        "SELECT DISTINCT event_name FROM events \
                         WHERE tenant_id = ? AND environment_id = ? ORDER BY event_name",
                    )
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .fetch_all::<NameRow>()
                    .await
            })
            .await?;
        Ok(rows.into_iter().map(|r| r.event_name).collect())
    }

    async fn fetch_raw_events(
        &self,
        scope: &EventScope,
        by: RawTimeColumn,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let column = match by {
            RawTimeColumn::IngestedAt => "ingested_at",
            RawTimeColumn::EventTime => "timestamp",
        };
        let sql = format!(
            "SELECT ?fields FROM events \
             WHERE tenant_id = ? AND environment_id = ? \
               AND {column} >= fromUnixTimestamp64Milli(?) AND {column} < fromUnixTimestamp64Milli(?) \
             ORDER BY timestamp"
        );
        let rows = self
            .with_deadline("fetch_raw_events", self.query_deadline, async {
                self.client
                    .query(&sql)
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .bind(start.timestamp_millis())
                    .bind(end.timestamp_millis())
                    .fetch_all::<EventRow>()
                    .await
            })
            .await?;
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    async fn delete_processed_before(
        &self,
        scope: &EventScope,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        fence: DateTime<Utc>,
    ) -> Result<u64> {
        let predicate = "tenant_id = ? AND environment_id = ? \
                         AND timestamp >= fromUnixTimestamp64Milli(?) AND timestamp < fromUnixTimestamp64Milli(?) \
                         AND processed_at < fromUnixTimestamp64Milli(?)";

        let count = self
            .with_deadline("count_processed_before", self.query_deadline, async {
                self.client
                    .query(&format!(
                        "SELECT count() AS count FROM events_processed WHERE {predicate}"
                    ))
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .bind(start.timestamp_millis())
                    .bind(end.timestamp_millis())
                    .bind(fence.timestamp_millis())
                    .fetch_one::<CountRow>()
                    .await
            })
            .await?;

        self.with_deadline("delete_processed_before", self.query_deadline, async {
            self.client
                .query(&format!(
                    "ALTER TABLE events_processed DELETE WHERE {predicate}"
                ))
                .bind(scope.tenant_id.as_str())
                .bind(scope.environment_id.as_str())
                .bind(start.timestamp_millis())
                .bind(end.timestamp_millis())
                .bind(fence.timestamp_millis())
                .execute()
                .await
        })
        .await?;

        Ok(count.count)
    }

    async fn purge_raw_events_before(
        &self,
        scope: &EventScope,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let predicate = "tenant_id = ? AND environment_id = ? AND timestamp < fromUnixTimestamp64Milli(?)";

        let count = self
            .with_deadline("count_raw_before", self.query_deadline, async {
                self.client
                    .query(&format!(
                        "SELECT count() AS count FROM events WHERE {predicate}"
                    ))
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .bind(cutoff.timestamp_millis())
                    .fetch_one::<CountRow>()
                    .await
            })
            .await?;

        self.with_deadline("purge_raw_events", self.query_deadline, async {
            self.client
                .query(&format!("ALTER TABLE events DELETE WHERE {predicate}"))
                .bind(scope.tenant_id.as_str())
                .bind(scope.environment_id.as_str())
                .bind(cutoff.timestamp_millis())
                .execute()
                .await
        })
        .await?;

        Ok(count.count)
    }

    async fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<()> {
        if letters.is_empty() {
            return Ok(());
        }

        #[derive(Row, Serialize)]
        struct DeadLetterRow {
            payload: String,
            reason: String,
            source: String,
            #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
            received_at: DateTime<Utc>,
        }

        self.with_deadline("insert_dead_letters", self.write_timeout, async {
            let mut insert = self.client.insert("events_dead_letter")?;
            for letter in letters {
                insert
                    .write(&DeadLetterRow {
                        payload: String::from_utf8_lossy(&letter.payload).into_owned(),
                        reason: letter.reason.clone(),
                        source: letter.source.clone(),
                        received_at: letter.received_at,
                    })
                    .await?;
            }
            insert.end().await
        })
        .await
    }

    async fn statistics(&self, scope: &EventScope) -> Result<StoreStatistics> {
        let raw = self
            .with_deadline("statistics", self.query_deadline, async {
                self.client
                    .query(
                        "SELECT count() AS raw_count, \
                                toUnixTimestamp64Milli(min(timestamp)) AS oldest_millis, \
                                toUnixTimestamp64Milli(max(timestamp)) AS newest_millis \
                         FROM events WHERE tenant_id = ? AND environment_id = ?",
                    )
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .fetch_one::<StatisticsRow>()
                    .await
            })
            .await?;

        let processed = self
            .with_deadline("statistics", self.query_deadline, async {
                self.client
                    .query(
                        "SELECT count() AS count FROM events_processed \
                         WHERE tenant_id = ? AND environment_id = ?",
                    )
                    .bind(scope.tenant_id.as_str())
                    .bind(scope.environment_id.as_str())
                    .fetch_one::<CountRow>()
                    .await
            })
            .await?;

        let bounds = |millis: i64| {
            (raw.raw_count > 0).then(|| DateTime::from_timestamp_millis(millis)).flatten()
        };

        Ok(StoreStatistics {
            raw_count: raw.raw_count,
            processed_count: processed.count,
            oldest_event: bounds(raw.oldest_millis),
            newest_event: bounds(raw.newest_millis),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadSource;
    use crate::domain::SubscriptionId;

    fn query(source: ReadSource, customer: bool) -> UsageQuery {
        UsageQuery {
            scope: EventScope {
                tenant_id: TenantId::new("t1"),
                environment_id: EnvironmentId::new("prod"),
            },
            subscription_id: SubscriptionId::new("sub_1"),
            customer_id: customer.then(|| CustomerId::new("cust_1")),
            external_customer_id: (!customer).then(|| "ext_1".to_string()),
            start: Utc::now(),
            end: Utc::now(),
            source,
            bucket_windows: vec![BucketWindow::Minute],
        }
    }

    #[test]
    fn test_invoice_reads_force_final() {
        let live = ClickHouseStore::usage_sql(&query(ReadSource::Live, true));
        let invoice = ClickHouseStore::usage_sql(&query(ReadSource::InvoiceCreation, true));
        assert!(!live.contains("FINAL"));
        assert!(invoice.contains("FROM events_processed FINAL"));
    }

    #[test]
    fn test_customer_predicate_switches_on_identity() {
        let internal = ClickHouseStore::usage_sql(&query(ReadSource::Live, true));
        let external = ClickHouseStore::usage_sql(&query(ReadSource::Live, false));
        assert!(internal.contains("customer_id = ?"));
        assert!(external.contains("external_customer_id = ?"));
    }

    #[test]
    fn test_single_scan_carries_every_aggregate() {
        let sql = ClickHouseStore::usage_sql(&query(ReadSource::Live, true));
        for column in [
            "sum_total",
            "max_total",
            "count_distinct_ids",
            "count_distinct_unique_hash",
            "latest_qty",
            "bucketed_max_minute",
            "bucketed_max_day",
        ] {
            assert!(sql.contains(column), "missing column {column}");
        }
        // One FROM events_processed: no per-meter fan-out.
        assert_eq!(sql.matches("FROM events_processed").count(), 1);
    }
}
