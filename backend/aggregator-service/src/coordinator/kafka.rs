//! Kafka binding of the consumer-group contract
//!
//! One task polls the `StreamConsumer` and hands records to a [`ClaimDispatcher`], which runs
//! one task per claimed partition, so each partition is processed strictly in order while
//! partitions run concurrently. Revocation is signalled from `pre_rebalance`, before
//! librdkafka hands the partitions to another member. A partition whose task falls behind is
//! paused instead of stalling the poll loop.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::dispatcher::{lock_controls, signal_all, ClaimDispatcher, ControlMap, Routed};
use super::{
    ClaimControl, ClaimHandler, CoordinatorError, LogRecord, OffsetCommitter, PartitionClaim,
    RebalanceEvent,
};
use crate::config::Config;
use crate::metrics;

/// How often backlogged partitions are retried while paused
const BACKLOG_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Kafka consumer configuration
#[derive(Debug, Clone)]
pub struct KafkaCoordinatorConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub session_timeout_ms: u64,
    /// Bound on the startup metadata request
    pub metadata_timeout: Duration,
    /// Records buffered per partition task
    pub claim_buffer: usize,
    /// Consecutive poll errors before leaving and rejoining the group
    pub resubscribe_after_errors: u32,
}

impl KafkaCoordinatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            brokers: config.kafka_brokers.clone(),
            topic: config.kafka_topic.clone(),
            group_id: config.kafka_group_id.clone(),
            session_timeout_ms: config.kafka_session_timeout_ms,
            metadata_timeout: config.metadata_timeout(),
            claim_buffer: config.claim_buffer,
            resubscribe_after_errors: config.resubscribe_after_errors,
        }
    }
}

fn claims_of(tpl: &TopicPartitionList) -> Vec<PartitionClaim> {
    tpl.elements()
        .iter()
        .map(|elem| PartitionClaim::new(elem.topic(), elem.partition()))
        .collect()
}

fn describe(claims: &[PartitionClaim]) -> String {
    claims
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Consumer context forwarding rebalance callbacks to the dispatcher.
pub struct ClaimContext {
    controls: ControlMap,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for ClaimContext {}

impl ConsumerContext for ClaimContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let claims = claims_of(tpl);
                {
                    let controls = lock_controls(&self.controls);
                    for claim in &claims {
                        if let Some(control) = controls.get(claim) {
                            let _ = control.send(ClaimControl::Revoked);
                        }
                    }
                }
                info!("Partitions revoked: {}", describe(&claims));
                metrics::record_rebalance("revoke");
                let _ = self.events.send(RebalanceEvent::Revoked(claims));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                // The assignment is gone; stop every claim before anything else is committed
                signal_all(&self.controls, ClaimControl::Revoked);
                warn!(error = %e, "Rebalance error");
                metrics::record_rebalance("error");
                let _ = self.events.send(RebalanceEvent::Error(e.to_string()));
            }
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let claims = claims_of(tpl);
            info!("Partitions assigned: {}", describe(&claims));
            metrics::record_rebalance("assign");
            let _ = self.events.send(RebalanceEvent::Assigned(claims));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partitions", offsets.count()),
            // Auto-commit ticks with nothing stored
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                warn!(error = %e, "Offset commit failed");
                metrics::record_offset_commit_failure();
            }
        }
    }
}

type AggregatorConsumer = StreamConsumer<ClaimContext>;

/// Stores processed offsets for the auto-committer; `flush` commits synchronously.
pub struct KafkaOffsetCommitter {
    consumer: Arc<AggregatorConsumer>,
}

impl OffsetCommitter for KafkaOffsetCommitter {
    fn mark_processed(&self, record: &LogRecord) -> Result<(), CoordinatorError> {
        // librdkafka commits stored offset + 1
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset)
            .map_err(|e| CoordinatorError::Commit {
                claim: record.claim(),
                offset: record.offset,
                reason: e.to_string(),
            })
    }

    fn flush(&self) -> Result<(), CoordinatorError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(CoordinatorError::Flush(e.to_string())),
        }
    }
}

/// Consecutive poll failures, with exponential backoff capped at 60s.
#[derive(Debug, Default)]
pub struct SessionErrorState {
    consecutive: u32,
}

impl SessionErrorState {
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_error(&mut self) -> u32 {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive
    }

    pub fn calculate_backoff(&self) -> Duration {
        const MIN_BACKOFF_SECS: u64 = 1;
        const MAX_BACKOFF_SECS: u64 = 60;

        if self.consecutive == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }

        let backoff_secs = 2u64
            .saturating_pow(self.consecutive.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(backoff_secs)
    }
}

/// Consumer-group member that drives a [`ClaimHandler`].
pub struct KafkaClaimCoordinator {
    consumer: Arc<AggregatorConsumer>,
    controls: ControlMap,
    rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    config: KafkaCoordinatorConfig,
}

impl KafkaClaimCoordinator {
    pub fn new(config: KafkaCoordinatorConfig) -> Result<Self, CoordinatorError> {
        info!("Initializing Kafka coordinator with config: {:?}", config);

        let controls: ControlMap = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = ClaimContext {
            controls: controls.clone(),
            events: events_tx,
        };

        let consumer: AggregatorConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.commit.interval.ms", "1000")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("partition.assignment.strategy", "range,roundrobin")
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                CoordinatorError::Kafka(e)
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            controls,
            rebalances: events_rx,
            config,
        })
    }

    /// Fetch topic metadata within the configured bound. Failure means the log is unreachable.
    pub async fn verify_topic(&self) -> Result<usize, CoordinatorError> {
        let consumer = self.consumer.clone();
        let topic = self.config.topic.clone();
        let timeout = self.config.metadata_timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(&topic), timeout)
        })
        .await
        .map_err(|e| CoordinatorError::Task(e.to_string()))??;

        let topic = metadata
            .topics()
            .iter()
            .find(|t| t.name() == self.config.topic)
            .ok_or(CoordinatorError::Kafka(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            )))?;

        if let Some(err) = topic.error() {
            return Err(CoordinatorError::Kafka(KafkaError::MetadataFetch(err.into())));
        }

        let partitions = topic.partitions().len();
        info!(
            "Topic {} reachable with {} partitions",
            self.config.topic, partitions
        );
        Ok(partitions)
    }

    pub fn subscribe(&self) -> Result<(), CoordinatorError> {
        self.consumer
            .subscribe(&[&self.config.topic])
            .map_err(|e| {
                error!("Failed to subscribe to topic: {}", e);
                CoordinatorError::Kafka(e)
            })?;
        info!("Subscribed to topic: {}", self.config.topic);
        Ok(())
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::new(KafkaOffsetCommitter {
            consumer: self.consumer.clone(),
        })
    }

    fn set_paused(&self, claims: &[PartitionClaim], paused: bool) {
        if claims.is_empty() {
            return;
        }
        let mut tpl = TopicPartitionList::new();
        for claim in claims {
            tpl.add_partition(&claim.topic, claim.partition);
        }

        let result = if paused {
            self.consumer.pause(&tpl)
        } else {
            self.consumer.resume(&tpl)
        };
        match result {
            Ok(()) if paused => info!("Paused slow partitions: {}", describe(claims)),
            Ok(()) => debug!("Resumed partitions: {}", describe(claims)),
            Err(e) => warn!(error = %e, paused, "Failed to change partition flow"),
        }
    }

    async fn dispatch_rebalance<H: ClaimHandler>(
        &self,
        dispatcher: &mut ClaimDispatcher<H>,
        event: RebalanceEvent,
    ) {
        let assigned = match &event {
            RebalanceEvent::Assigned(claims) => claims.clone(),
            _ => Vec::new(),
        };
        dispatcher.handle_rebalance(event).await;
        // A new assignment must not inherit a pause from an earlier generation
        self.set_paused(&assigned, false);
    }

    /// Poll until `shutdown` flips, then drain partition tasks and commit.
    pub async fn run<H: ClaimHandler>(
        mut self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), CoordinatorError> {
        info!("Starting claim dispatcher");

        let consumer = self.consumer.clone();
        let mut dispatcher = ClaimDispatcher::new(
            handler,
            self.committer(),
            self.controls.clone(),
            self.config.claim_buffer,
        );
        let mut errors = SessionErrorState::default();
        let mut backlog_tick = tokio::time::interval(BACKLOG_RETRY_INTERVAL);
        backlog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'poll: loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break 'poll,
                Some(event) = self.rebalances.recv() => {
                    self.dispatch_rebalance(&mut dispatcher, event).await;
                }
                _ = backlog_tick.tick(), if dispatcher.has_backlog() => {
                    let drained = dispatcher.flush_backlogs();
                    self.set_paused(&drained, false);
                }
                message = consumer.recv() => match message {
                    Ok(message) => {
                        errors.record_success();
                        let record = to_record(&message);
                        drop(message);

                        if !dispatcher.owns(&record.claim()) {
                            // The assignment that delivered this record may still be queued
                            while let Ok(event) = self.rebalances.try_recv() {
                                self.dispatch_rebalance(&mut dispatcher, event).await;
                            }
                        }

                        if let Routed::Backpressure(claim) = dispatcher.route(record) {
                            self.set_paused(&[claim], true);
                        }
                    }
                    Err(e) => {
                        metrics::record_consumer_error();
                        let consecutive = errors.record_error();
                        let backoff = errors.calculate_backoff();
                        error!(
                            "Kafka consumer error ({} consecutive), backing off {:?}: {}",
                            consecutive, backoff, e
                        );

                        tokio::select! {
                            _ = shutdown.changed() => break 'poll,
                            _ = tokio::time::sleep(backoff) => {}
                        }

                        if consecutive >= self.config.resubscribe_after_errors {
                            warn!("Rejoining consumer group after {} consecutive errors", consecutive);
                            consumer.unsubscribe();
                            if let Err(e) = self.subscribe() {
                                error!("Resubscribe failed, will retry: {}", e);
                            }
                        }
                    }
                }
            }
        }

        dispatcher.drain().await;
        self.consumer.unsubscribe();
        info!("Claim dispatcher stopped");
        Ok(())
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> LogRecord {
    LogRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp_ms: message.timestamp().to_millis(),
    }
}
