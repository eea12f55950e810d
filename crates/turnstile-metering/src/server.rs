//! Process wiring: consumers, materializer, retention sweep, shutdown.

use crate::config::MeteringConfig;
use crate::ingest::{BatchingConsumer, KafkaEventLog};
use crate::materializer::{CatalogProvider, Materializer, StaticCatalogProvider};
use crate::store::{ClickHouseStore, EventStore};
use crate::usage::UsageEngine;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Retention sweeps don't need to be prompt, just regular.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct MeteringServer {
    config: MeteringConfig,
    store: Arc<ClickHouseStore>,
    catalog: Arc<dyn CatalogProvider>,
}

impl MeteringServer {
    pub fn new(config: MeteringConfig) -> Self {
        let store = Arc::new(ClickHouseStore::new(&config.store));
        Self {
            config,
            store,
            catalog: StaticCatalogProvider::new(),
        }
    }

    /// Swap in the catalog source. The default static provider is empty;
    /// production deployments sync it from the administrative plane.
    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogProvider>) -> Self {
        self.catalog = catalog;
        self
    }

    pub async fn run_schema_setup(&self) -> anyhow::Result<()> {
        self.store.ensure_schema().await?;
        Ok(())
    }

    /// A usage engine sharing this server's store and read-source config.
    pub fn usage_engine(&self) -> UsageEngine {
        UsageEngine::new(
            self.store.clone(),
            self.catalog.clone(),
            self.config.aggregation.source,
        )
    }

    /// Run the pipeline until the shutdown future resolves, then drain:
    /// consumers flush their open batches and in-flight writes complete.
    pub async fn serve(
        self,
        shutdown_signal: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let mut handles = Vec::new();

        for consumer_index in 0..self.config.log.consumers {
            let log = Arc::new(KafkaEventLog::new(&self.config.log)?);
            let consumer = BatchingConsumer::new(
                log,
                self.store.clone(),
                &self.config.batch,
                self.config.log.topic.clone(),
            );
            info!(consumer_index, topic = %self.config.log.topic, "Starting consumer");
            handles.push(tokio::spawn(consumer.run(token.clone())));
        }

        let materializer = Materializer::new(self.store.clone(), self.catalog.clone());
        handles.push(tokio::spawn(materializer.run(
            self.config.materializer_window(),
            self.config.materializer_interval(),
            token.clone(),
        )));

        if self.config.retention.raw_event_days > 0 {
            handles.push(tokio::spawn(retention_sweep(
                self.store.clone(),
                self.catalog.clone(),
                self.config.retention.raw_event_days,
                token.clone(),
            )));
        }

        shutdown_signal.await;
        info!("Shutdown requested, draining pipeline");
        token.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Metering server stopped");
        Ok(())
    }
}

async fn retention_sweep(
    store: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogProvider>,
    raw_event_days: u32,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now() - ChronoDuration::days(raw_event_days as i64);
        let scopes = match catalog.scopes().await {
            Ok(scopes) => scopes,
            Err(e) => {
                error!(error = %e, "Retention sweep could not list scopes");
                continue;
            }
        };
        for scope in scopes {
            match store.purge_raw_events_before(&scope, cutoff).await {
                Ok(purged) if purged > 0 => {
                    info!(
                        tenant = %scope.tenant_id,
                        environment = %scope.environment_id,
                        purged,
                        %cutoff,
                        "store.retention_purged"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(tenant = %scope.tenant_id, error = %e, "Retention sweep failed");
                }
            }
        }
    }
}
