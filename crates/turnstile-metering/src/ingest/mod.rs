pub mod consumer;
pub mod log;
pub mod memory;

pub use consumer::BatchingConsumer;
pub use log::{Delivery, EventLog, KafkaEventLog, Receipt};
pub use memory::MemoryEventLog;
