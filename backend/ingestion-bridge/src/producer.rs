use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::BridgeError;

/// Append-only sink for encoded sale events.
#[async_trait]
pub trait SaleLog: Send + Sync {
    async fn append(&self, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// Kafka producer wrapper for the sales topic.
#[derive(Clone)]
pub struct KafkaSaleLog {
    inner: Arc<FutureProducer>,
    topic: String,
    queue_timeout: Duration,
}

impl KafkaSaleLog {
    pub fn new(brokers: &str, topic: &str, queue_timeout: Duration) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| anyhow::anyhow!("Failed to create Kafka producer for '{}': {}", topic, e))?;

        Ok(Self {
            inner: Arc::new(producer),
            topic: topic.to_string(),
            queue_timeout,
        })
    }
}

#[async_trait]
impl SaleLog for KafkaSaleLog {
    async fn append(&self, payload: Vec<u8>) -> Result<(), BridgeError> {
        // No key: the default partitioner spreads sales across partitions
        let record = FutureRecord::<(), [u8]>::to(&self.topic).payload(&payload);

        let (partition, offset) = self
            .inner
            .send(record, Timeout::After(self.queue_timeout))
            .await
            .map_err(|(err, _)| BridgeError::Publish(err.to_string()))?;

        debug!(
            "Sale appended: topic={}, partition={}, offset={}",
            self.topic, partition, offset
        );
        Ok(())
    }
}
