//! Partitioned event log adapter.
//!
//! The log delivers messages at least once with per-partition FIFO order.
//! Nothing is ever committed implicitly: the consumer decides per message
//! via [`EventLog::ack`] / [`EventLog::nack`], long after the handler that
//! received the message has returned.

use crate::config::EventLogConfig;
use crate::error::{MeteringError, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Position of one message; the token the batch holds until flush settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    pub partition: i32,
    pub offset: i64,
}

/// One message pulled off the log.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub receipt: Receipt,
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Wait for the next message. Cancellation-safe.
    async fn next(&self) -> Result<Delivery>;

    /// Mark the message durable-handled; its offset becomes commit-eligible.
    async fn ack(&self, receipt: &Receipt) -> Result<()>;

    /// Give the message back. `requeue` asks for redelivery; without it the
    /// offset advances and the message never comes back (its payload must
    /// already be safe elsewhere, e.g. the dead-letter sink).
    async fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<()>;

    /// Ack a whole batch. Implementations may fold this into one commit.
    async fn ack_many(&self, receipts: &[Receipt]) -> Result<()> {
        for receipt in receipts {
            self.ack(receipt).await?;
        }
        Ok(())
    }

    async fn nack_many(&self, receipts: &[Receipt], requeue: bool) -> Result<()> {
        for receipt in receipts {
            self.nack(receipt, requeue).await?;
        }
        Ok(())
    }
}

/// Kafka-backed event log. Auto-commit is off; every committed offset went
/// through [`EventLog::ack`].
pub struct KafkaEventLog {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventLog {
    pub fn new(config: &EventLogConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| MeteringError::LogError {
                message: format!("failed to create consumer: {e}"),
            })?;

        consumer
            .subscribe(&[&config.topic])
            .map_err(|e| MeteringError::LogError {
                message: format!("failed to subscribe to {}: {e}", config.topic),
            })?;

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn commit_list(&self, offsets: &HashMap<i32, i64>) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in offsets {
            tpl.add_partition_offset(&self.topic, *partition, Offset::Offset(offset + 1))
                .map_err(|e| MeteringError::LogError {
                    message: format!("failed to build commit list: {e}"),
                })?;
        }
        Ok(tpl)
    }

    fn commit(&self, offsets: &HashMap<i32, i64>, mode: CommitMode) -> Result<()> {
        let tpl = self.commit_list(offsets)?;
        self.consumer
            .commit(&tpl, mode)
            .map_err(|e| MeteringError::LogError {
                message: format!("offset commit failed: {e}"),
            })
    }
}

#[async_trait]
impl EventLog for KafkaEventLog {
    async fn next(&self) -> Result<Delivery> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| MeteringError::LogError {
                message: format!("receive failed: {e}"),
            })?;

        Ok(Delivery {
            payload: message.payload().unwrap_or_default().to_vec(),
            key: message.key().map(|k| k.to_vec()),
            receipt: Receipt {
                partition: message.partition(),
                offset: message.offset(),
            },
        })
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        self.commit(
            &HashMap::from([(receipt.partition, receipt.offset)]),
            CommitMode::Async,
        )
    }

    async fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<()> {
        if requeue {
            self.consumer
                .seek(
                    &self.topic,
                    receipt.partition,
                    Offset::Offset(receipt.offset),
                    Duration::from_secs(5),
                )
                .map_err(|e| MeteringError::LogError {
                    message: format!("seek for redelivery failed: {e}"),
                })?;
            debug!(
                partition = receipt.partition,
                offset = receipt.offset,
                "Rewound partition for redelivery"
            );
            Ok(())
        } else {
            // Permanent: advance past the message.
            self.commit(
                &HashMap::from([(receipt.partition, receipt.offset)]),
                CommitMode::Async,
            )
        }
    }

    async fn ack_many(&self, receipts: &[Receipt]) -> Result<()> {
        if receipts.is_empty() {
            return Ok(());
        }
        // One synchronous commit of the highest offset per partition.
        let mut offsets: HashMap<i32, i64> = HashMap::new();
        for receipt in receipts {
            let entry = offsets.entry(receipt.partition).or_insert(receipt.offset);
            *entry = (*entry).max(receipt.offset);
        }
        self.commit(&offsets, CommitMode::Sync)
    }

    async fn nack_many(&self, receipts: &[Receipt], requeue: bool) -> Result<()> {
        if receipts.is_empty() {
            return Ok(());
        }
        if !requeue {
            let mut offsets: HashMap<i32, i64> = HashMap::new();
            for receipt in receipts {
                let entry = offsets.entry(receipt.partition).or_insert(receipt.offset);
                *entry = (*entry).max(receipt.offset);
            }
            return self.commit(&offsets, CommitMode::Async);
        }

        // Rewind each partition to its lowest uncommitted offset.
        let mut lowest: HashMap<i32, i64> = HashMap::new();
        for receipt in receipts {
            let entry = lowest.entry(receipt.partition).or_insert(receipt.offset);
            *entry = (*entry).min(receipt.offset);
        }
        for (partition, offset) in lowest {
            if let Err(e) = self.consumer.seek(
                &self.topic,
                partition,
                Offset::Offset(offset),
                Duration::from_secs(5),
            ) {
                warn!(partition, offset, error = %e, "Seek for batch redelivery failed");
                return Err(MeteringError::LogError {
                    message: format!("seek for redelivery failed: {e}"),
                });
            }
        }
        Ok(())
    }
}
