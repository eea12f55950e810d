//! Batching consumer: the ack-after-persist core of the ingestion path.
//!
//! Messages append to the open batch and the handler returns immediately;
//! their receipts stay with the batch. Only after the store acknowledges the
//! bulk insert does the whole batch ack. A failed insert nacks every message
//! for redelivery and the consumer moves on; the log is the retry mechanism.
//!
//! Batch lifecycle: open -> flushing -> acked | nacked. Flushing runs
//! concurrently with appends into a fresh batch, at most one flush in flight.

use super::log::{Delivery, EventLog, Receipt};
use crate::config::{BatchConfig, MalformedPolicy};
use crate::domain::{Event, ProcessedEvent};
use crate::error::MeteringError;
use crate::store::{DeadLetter, EventStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct OpenBatch {
    events: Vec<Event>,
    receipts: Vec<Receipt>,
    opened_at: Option<Instant>,
}

impl OpenBatch {
    fn take(&mut self) -> OpenBatch {
        std::mem::take(self)
    }
}

pub struct BatchingConsumer {
    log: Arc<dyn EventLog>,
    store: Arc<dyn EventStore>,
    max_size: usize,
    max_interval: Duration,
    malformed_policy: MalformedPolicy,
    /// Source tag recorded on dead letters.
    source: String,
    batch: Mutex<OpenBatch>,
    inflight_flush: Mutex<Option<JoinHandle<()>>>,
}

impl BatchingConsumer {
    pub fn new(
        log: Arc<dyn EventLog>,
        store: Arc<dyn EventStore>,
        config: &BatchConfig,
        source: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            store,
            max_size: config.max_size,
            max_interval: Duration::from_millis(config.max_interval_ms),
            malformed_policy: config.malformed_policy,
            source: source.into(),
            batch: Mutex::new(OpenBatch::default()),
            inflight_flush: Mutex::new(None),
        })
    }

    /// Consume until cancelled, then drain: the open batch flushes and any
    /// in-flight flush runs to completion. A flush that has started writing
    /// is never aborted, otherwise store visibility would disagree with acks.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(source = %self.source, "Batching consumer started");
        loop {
            let deadline = {
                let batch = self.batch.lock().await;
                batch.opened_at.map(|at| at + self.max_interval)
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_until_or_pend(deadline) => {
                    Arc::clone(&self).begin_flush("interval").await;
                }
                received = self.log.next() => match received {
                    Ok(delivery) => Arc::clone(&self).handle(delivery).await,
                    Err(e) => {
                        error!(error = %e, "Event log receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }

        Arc::clone(&self).begin_flush("shutdown").await;
        if let Some(handle) = self.inflight_flush.lock().await.take() {
            let _ = handle.await;
        }
        info!(source = %self.source, "Batching consumer stopped");
    }

    /// Handle one delivery. Returns as soon as the event is appended; acking
    /// waits for the batch's durable write.
    async fn handle(self: Arc<Self>, delivery: Delivery) {
        let event = match serde_json::from_slice::<Event>(&delivery.payload) {
            Ok(event) => match event.validate() {
                Ok(()) => event,
                Err(e) => {
                    self.reject(delivery, Some(event), e).await;
                    return;
                }
            },
            Err(e) => {
                self.reject(delivery, None, e.into()).await;
                return;
            }
        };

        let reached_cap = {
            let mut batch = self.batch.lock().await;
            batch.events.push(event);
            batch.receipts.push(delivery.receipt);
            batch.opened_at.get_or_insert_with(Instant::now);
            batch.events.len() >= self.max_size
        };

        if reached_cap {
            self.begin_flush("size").await;
        }
    }

    /// Swap the open batch for a fresh one and flush it on its own task.
    /// Waits for a previous flush first so at most one is in flight.
    async fn begin_flush(self: Arc<Self>, reason: &'static str) {
        let taken = self.batch.lock().await.take();
        if taken.events.is_empty() {
            return;
        }

        let mut inflight = self.inflight_flush.lock().await;
        if let Some(handle) = inflight.take() {
            let _ = handle.await;
        }

        let consumer = Arc::clone(&self);
        *inflight = Some(tokio::spawn(async move {
            consumer.flush(taken, reason).await;
        }));
    }

    async fn flush(&self, batch: OpenBatch, reason: &'static str) {
        let size = batch.events.len();
        let first_offset = batch.receipts.iter().map(|r| r.offset).min().unwrap_or(0);
        let last_offset = batch.receipts.iter().map(|r| r.offset).max().unwrap_or(0);
        info!(reason, size, first_offset, last_offset, "batch.flushed");

        match self.store.insert_events(&batch.events).await {
            Ok(()) => match self.log.ack_many(&batch.receipts).await {
                Ok(()) => {
                    info!(size, first_offset, last_offset, "batch.acked");
                }
                Err(e) => {
                    // The write landed; redelivered events dedupe downstream
                    // via the replacing merge.
                    warn!(error = %e, size, "Offset commit failed after durable write");
                }
            },
            Err(e) => {
                error!(error = %e, size, first_offset, last_offset, "store.write_failed");
                match self.log.nack_many(&batch.receipts, true).await {
                    Ok(()) => info!(size, first_offset, last_offset, "batch.nacked"),
                    Err(nack_err) => {
                        warn!(error = %nack_err, size, "Redelivery request failed");
                    }
                }
            }
        }
    }

    /// Settle a message that failed decoding or validation. Never a silent
    /// drop: the payload lands in the dead-letter sink (or, for decodable
    /// events under the zero-quantity policy, as an unbilled processed row)
    /// before its offset advances.
    async fn reject(&self, delivery: Delivery, event: Option<Event>, cause: MeteringError) {
        debug!(offset = delivery.receipt.offset, error = %cause, "Rejecting malformed message");

        let outcome = match (&self.malformed_policy, event) {
            (MalformedPolicy::ZeroQuantity, Some(event)) => {
                let row = ProcessedEvent::unattributed(&event, Utc::now());
                self.store.insert_processed(&[row]).await
            }
            _ => {
                let letter = DeadLetter {
                    payload: delivery.payload.clone(),
                    reason: cause.to_string(),
                    source: self.source.clone(),
                    received_at: Utc::now(),
                };
                self.store.insert_dead_letters(&[letter]).await
            }
        };

        let settle = match outcome {
            // Permanently settled; the offset may advance.
            Ok(()) => self.log.nack(&delivery.receipt, false).await,
            // Could not preserve the payload; ask for redelivery instead.
            Err(e) => {
                warn!(error = %e, "Dead-letter write failed, requeueing message");
                self.log.nack(&delivery.receipt, true).await
            }
        };
        if let Err(e) = settle {
            warn!(error = %e, offset = delivery.receipt.offset, "Failed to settle rejected message");
        }
    }
}

async fn sleep_until_or_pend(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
