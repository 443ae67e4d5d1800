//! Consumer-group contract
//!
//! The worker only sees these types: partition claims, owned log records, a per-claim control
//! signal and an offset committer. The Kafka binding in [`kafka`] drives them from librdkafka
//! rebalance callbacks; tests drive them from plain channels.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod claims;
pub mod dispatcher;
pub mod kafka;

pub use claims::{ClaimRegistry, ClaimState};
pub use dispatcher::{ClaimDispatcher, Routed};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid claim transition for {claim}: {from:?} -> {to:?}")]
    InvalidTransition {
        claim: PartitionClaim,
        from: ClaimState,
        to: ClaimState,
    },

    #[error("offset commit failed for {claim} at offset {offset}: {reason}")]
    Commit {
        claim: PartitionClaim,
        offset: i64,
        reason: String,
    },

    #[error("offset flush failed: {0}")]
    Flush(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Ownership of one partition of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionClaim {
    pub topic: String,
    pub partition: i32,
}

impl PartitionClaim {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A message detached from the consumer, so it can cross into a partition task.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
    /// Broker or producer timestamp, milliseconds since the epoch
    pub timestamp_ms: Option<i64>,
}

impl LogRecord {
    pub fn claim(&self) -> PartitionClaim {
        PartitionClaim::new(self.topic.clone(), self.partition)
    }
}

/// Control signal a partition task watches between records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimControl {
    Active,
    /// The group took the partition away. Stop without committing unfinished work.
    Revoked,
    /// Process shutdown. Finish the current record, commit, stop.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimExit {
    /// The record channel closed.
    Drained,
    Revoked,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(Vec<PartitionClaim>),
    Revoked(Vec<PartitionClaim>),
    Error(String),
}

/// Lifecycle hooks the worker implements for the coordinator.
#[async_trait]
pub trait ClaimHandler: Send + Sync + 'static {
    /// Runs once per assignment, before any record is delivered.
    async fn setup(&self, claims: &[PartitionClaim]);

    /// Consume one claim until its channel closes or the control signal says stop.
    async fn consume_claim(
        &self,
        claim: PartitionClaim,
        records: mpsc::Receiver<LogRecord>,
        committer: Arc<dyn OffsetCommitter>,
        control: watch::Receiver<ClaimControl>,
    ) -> ClaimExit;

    /// Runs after claims were revoked or closed.
    async fn cleanup(&self, claims: &[PartitionClaim]);
}

/// Offset bookkeeping exposed by the log client.
pub trait OffsetCommitter: Send + Sync {
    /// Record that `record` and everything before it on its partition is fully processed.
    fn mark_processed(&self, record: &LogRecord) -> Result<(), CoordinatorError>;

    /// Synchronously commit whatever has been marked.
    fn flush(&self) -> Result<(), CoordinatorError>;
}
