//! Single-partition in-memory event log with the same ack/nack contract as
//! the Kafka adapter: at-least-once, FIFO, explicit commits, redelivery on
//! requeue. Backs tests and local development.

use super::log::{Delivery, EventLog, Receipt};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct Inner {
    /// Offsets ready for delivery, in delivery order.
    ready: VecDeque<i64>,
    /// Payloads of every offset not yet permanently settled.
    messages: HashMap<i64, (Vec<u8>, Option<Vec<u8>>)>,
    committed: BTreeSet<i64>,
    next_offset: i64,
}

#[derive(Default)]
pub struct MemoryEventLog {
    inner: Mutex<Inner>,
    notify: Notify,
    requeues: AtomicU64,
}

impl MemoryEventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append a message as a producer would.
    pub async fn produce(&self, payload: Vec<u8>) -> i64 {
        let mut inner = self.inner.lock().await;
        let offset = inner.next_offset;
        inner.next_offset += 1;
        inner.messages.insert(offset, (payload, None));
        inner.ready.push_back(offset);
        drop(inner);
        self.notify.notify_waiters();
        offset
    }

    /// Offsets settled by ack or permanent nack, ascending.
    pub async fn committed_offsets(&self) -> Vec<i64> {
        self.inner.lock().await.committed.iter().copied().collect()
    }

    /// Messages currently awaiting delivery or redelivery.
    pub async fn pending(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    /// How many messages have been handed back for redelivery.
    pub fn requeue_count(&self) -> u64 {
        self.requeues.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn next(&self) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().await;
                if let Some(offset) = inner.ready.pop_front() {
                    let (payload, key) = inner
                        .messages
                        .get(&offset)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(Delivery {
                        payload,
                        key,
                        receipt: Receipt {
                            partition: 0,
                            offset,
                        },
                    });
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.committed.insert(receipt.offset);
        inner.messages.remove(&receipt.offset);
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, requeue: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if requeue {
            if inner.messages.contains_key(&receipt.offset) {
                inner.ready.push_back(receipt.offset);
                self.requeues.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            inner.committed.insert(receipt.offset);
            inner.messages.remove(&receipt.offset);
        }
        drop(inner);
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
