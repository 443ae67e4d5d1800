//! Claim loop driven by plain channels instead of a broker.

use aggregator_service::coordinator::dispatcher::ControlMap;
use aggregator_service::coordinator::{
    ClaimControl, ClaimDispatcher, ClaimExit, ClaimHandler, ClaimRegistry, ClaimState,
    CoordinatorError, LogRecord, OffsetCommitter, PartitionClaim, RebalanceEvent, Routed,
};
use aggregator_service::services::{AggregatorConfig, AggregatorWorker, SaleAggregator};
use aggregator_service::store::{
    AnalyticsStore, Extremum, InMemoryAnalyticsStore, StoreError, StreamEntry,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn payload(category: i32, product: &str, price: f64, quantity: u32) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "categoria": category,
        "producto_id": product,
        "precio": price,
        "cantidad_vendida": quantity,
    }))
    .unwrap()
}

fn record(offset: i64, payload: Vec<u8>) -> LogRecord {
    LogRecord {
        topic: "sales".to_string(),
        partition: 0,
        offset,
        payload,
        timestamp_ms: Some(1_700_000_000_000 + offset),
    }
}

/// Records marked offsets; optionally sends a control signal after a given offset.
struct TestCommitter {
    marked: Mutex<Vec<i64>>,
    signal_after: Option<(i64, ClaimControl, watch::Sender<ClaimControl>)>,
}

impl TestCommitter {
    fn new() -> Self {
        Self {
            marked: Mutex::new(Vec::new()),
            signal_after: None,
        }
    }

    fn signalling(offset: i64, signal: ClaimControl, tx: watch::Sender<ClaimControl>) -> Self {
        Self {
            marked: Mutex::new(Vec::new()),
            signal_after: Some((offset, signal, tx)),
        }
    }

    fn marked(&self) -> Vec<i64> {
        self.marked.lock().unwrap().clone()
    }

    async fn wait_for(&self, offset: i64) {
        for _ in 0..200 {
            if self.marked().contains(&offset) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("offset {} was never marked", offset);
    }
}

impl OffsetCommitter for TestCommitter {
    fn mark_processed(&self, record: &LogRecord) -> Result<(), CoordinatorError> {
        self.marked.lock().unwrap().push(record.offset);
        if let Some((offset, signal, tx)) = &self.signal_after {
            if *offset == record.offset {
                let _ = tx.send(*signal);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), CoordinatorError> {
        Ok(())
    }
}

/// Delegating store that flips the claim control once `total_ventas` is incremented,
/// i.e. in the middle of an event's mutation sequence.
struct SignallingStore {
    inner: InMemoryAnalyticsStore,
    control: watch::Sender<ClaimControl>,
    signal: ClaimControl,
    fired: AtomicBool,
}

#[async_trait]
impl AnalyticsStore for SignallingStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let value = self.inner.increment(key).await;
        if key == "total_ventas" && !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.control.send(self.signal);
        }
        value
    }

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.increment_by(key, delta).await
    }

    async fn increment_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        self.inner.increment_by_float(key, delta).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.inner.set_if_absent(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        self.inner.sorted_set_increment(key, member, delta).await
    }

    async fn capped_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
    ) -> Result<String, StoreError> {
        self.inner.capped_append(key, fields, max_len).await
    }

    async fn update_extremum(
        &self,
        key: &str,
        value: f64,
        extremum: Extremum,
    ) -> Result<bool, StoreError> {
        self.inner.update_extremum(key, value, extremum).await
    }

    async fn sorted_set_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.inner.sorted_set_desc(key, limit).await
    }

    async fn stream_entries(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError> {
        self.inner.stream_entries(key).await
    }
}

fn memory_worker() -> AggregatorWorker<InMemoryAnalyticsStore> {
    AggregatorWorker::new(SaleAggregator::new(
        Arc::new(InMemoryAnalyticsStore::new()),
        AggregatorConfig::default(),
    ))
}

#[tokio::test]
async fn test_records_are_applied_in_partition_order() {
    let worker = memory_worker();
    let committer = Arc::new(TestCommitter::new());
    let (tx, rx) = mpsc::channel(16);
    let (_control_tx, control_rx) = watch::channel(ClaimControl::Active);

    // The first record decides the monitored product
    for (offset, product) in ["Primero", "Segundo", "Primero", "Tercero"].iter().enumerate() {
        tx.send(record(offset as i64, payload(1, product, 10.0 + offset as f64, 1)))
            .await
            .unwrap();
    }
    drop(tx);

    let exit = worker
        .consume_claim(
            PartitionClaim::new("sales", 0),
            rx,
            committer.clone(),
            control_rx,
        )
        .await;

    assert_eq!(exit, ClaimExit::Drained);
    assert_eq!(committer.marked(), vec![0, 1, 2, 3]);

    let store = worker.aggregator().store();
    assert_eq!(
        store
            .get("producto_monitoreado_nombre:Electronica")
            .await
            .unwrap()
            .as_deref(),
        Some("Primero")
    );
    let history = store
        .stream_entries("stream_precio_producto_unico:Electronica")
        .await
        .unwrap();
    let prices: Vec<_> = history.iter().filter_map(|e| e.field("precio")).collect();
    assert_eq!(prices, vec!["10", "12"]);
}

#[tokio::test]
async fn test_undecodable_record_advances_offset() {
    let worker = memory_worker();
    let committer = Arc::new(TestCommitter::new());
    let (tx, rx) = mpsc::channel(16);
    let (_control_tx, control_rx) = watch::channel(ClaimControl::Active);

    tx.send(record(10, b"{\"categoria\": 1}".to_vec())).await.unwrap();
    tx.send(record(11, payload(2, "Jeans", 30.0, 1))).await.unwrap();
    drop(tx);

    worker
        .consume_claim(
            PartitionClaim::new("sales", 0),
            rx,
            committer.clone(),
            control_rx,
        )
        .await;

    assert_eq!(committer.marked(), vec![10, 11]);
    assert_eq!(
        worker
            .aggregator()
            .store()
            .get("total_ventas")
            .await
            .unwrap()
            .as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_revocation_between_records_stops_consumption() {
    let worker = memory_worker();
    let (control_tx, control_rx) = watch::channel(ClaimControl::Active);
    let committer = Arc::new(TestCommitter::signalling(
        1,
        ClaimControl::Revoked,
        control_tx,
    ));
    let (tx, rx) = mpsc::channel(16);

    for offset in 0..4 {
        tx.send(record(offset, payload(3, "Mesa", 50.0, 1))).await.unwrap();
    }

    let exit = worker
        .consume_claim(
            PartitionClaim::new("sales", 0),
            rx,
            committer.clone(),
            control_rx,
        )
        .await;

    assert_eq!(exit, ClaimExit::Revoked);
    assert_eq!(committer.marked(), vec![0, 1]);
    assert_eq!(
        worker
            .aggregator()
            .store()
            .get("counter:Hogar")
            .await
            .unwrap()
            .as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn test_record_revoked_mid_sequence_is_not_committed() {
    let (control_tx, control_rx) = watch::channel(ClaimControl::Active);
    let store = Arc::new(SignallingStore {
        inner: InMemoryAnalyticsStore::new(),
        control: control_tx,
        signal: ClaimControl::Revoked,
        fired: AtomicBool::new(false),
    });
    let worker = AggregatorWorker::new(SaleAggregator::new(
        store.clone(),
        AggregatorConfig::default(),
    ));
    let committer = Arc::new(TestCommitter::new());
    let (tx, rx) = mpsc::channel(16);

    tx.send(record(0, payload(4, "Crema", 8.0, 1))).await.unwrap();
    tx.send(record(1, payload(4, "Crema", 9.0, 1))).await.unwrap();

    let exit = worker
        .consume_claim(
            PartitionClaim::new("sales", 0),
            rx,
            committer.clone(),
            control_rx,
        )
        .await;

    assert_eq!(exit, ClaimExit::Revoked);
    // The mutations landed but the offset stays with the next owner, who will redeliver it
    assert!(committer.marked().is_empty());
    assert_eq!(
        store.get("counter:Belleza").await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_shutdown_finishes_current_record_and_commits() {
    let (control_tx, control_rx) = watch::channel(ClaimControl::Active);
    let store = Arc::new(SignallingStore {
        inner: InMemoryAnalyticsStore::new(),
        control: control_tx,
        signal: ClaimControl::Shutdown,
        fired: AtomicBool::new(false),
    });
    let worker = AggregatorWorker::new(SaleAggregator::new(
        store.clone(),
        AggregatorConfig::default(),
    ));
    let committer = Arc::new(TestCommitter::new());
    let (tx, rx) = mpsc::channel(16);

    for offset in 0..3 {
        tx.send(record(offset, payload(1, "Laptop", 900.0, 1))).await.unwrap();
    }

    let exit = worker
        .consume_claim(
            PartitionClaim::new("sales", 0),
            rx,
            committer.clone(),
            control_rx,
        )
        .await;

    assert_eq!(exit, ClaimExit::Shutdown);
    assert_eq!(committer.marked(), vec![0]);
    // Every step of the in-flight event completed
    assert_eq!(
        store.get("precio_min_global").await.unwrap().as_deref(),
        Some("900")
    );
    assert_eq!(
        store.get("counter:Electronica").await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn test_handler_lifecycle_with_registry() {
    let worker = Arc::new(memory_worker());
    let committer: Arc<dyn OffsetCommitter> = Arc::new(TestCommitter::new());
    let mut registry = ClaimRegistry::new();
    let claims = vec![
        PartitionClaim::new("sales", 0),
        PartitionClaim::new("sales", 1),
    ];

    for claim in &claims {
        registry.transition(claim, ClaimState::Claimed).unwrap();
    }
    worker.setup(&claims).await;

    let mut senders = Vec::new();
    let mut controls = Vec::new();
    let mut handles = Vec::new();
    for claim in &claims {
        let (tx, rx) = mpsc::channel(16);
        let (control_tx, control_rx) = watch::channel(ClaimControl::Active);
        registry.transition(claim, ClaimState::Consuming).unwrap();

        let worker = worker.clone();
        let committer = committer.clone();
        let claim = claim.clone();
        handles.push(tokio::spawn(async move {
            worker.consume_claim(claim, rx, committer, control_rx).await
        }));
        senders.push(tx);
        controls.push(control_tx);
    }
    assert_eq!(registry.active_count(), 2);

    for (partition, tx) in senders.iter().enumerate() {
        let mut r = record(0, payload(2, "Bufanda", 12.0, 2));
        r.partition = partition as i32;
        tx.send(r).await.unwrap();
    }

    // Partition 0 is revoked, partition 1 closed by shutdown
    controls[0].send(ClaimControl::Revoked).unwrap();
    controls[1].send(ClaimControl::Shutdown).unwrap();
    drop(senders);

    let mut exits = Vec::new();
    for handle in handles {
        exits.push(handle.await.unwrap());
    }
    assert!(matches!(exits[0], ClaimExit::Revoked | ClaimExit::Drained));
    assert!(matches!(exits[1], ClaimExit::Shutdown | ClaimExit::Drained));

    registry.transition(&claims[0], ClaimState::Revoked).unwrap();
    registry.transition(&claims[1], ClaimState::Closed).unwrap();
    worker.cleanup(&claims).await;
    assert_eq!(registry.active_count(), 0);

    // A revoked partition can be claimed again after the next rebalance
    registry.transition(&claims[0], ClaimState::Claimed).unwrap();
    assert_eq!(registry.state(&claims[0]), ClaimState::Claimed);
}

#[tokio::test]
async fn test_partition_is_consumed_again_after_rebalance_error() {
    let worker = Arc::new(memory_worker());
    let committer = Arc::new(TestCommitter::new());
    let controls: ControlMap = Arc::new(Mutex::new(HashMap::new()));
    let mut dispatcher = ClaimDispatcher::new(worker.clone(), committer.clone(), controls, 16);
    let claim = PartitionClaim::new("sales", 0);

    dispatcher
        .handle_rebalance(RebalanceEvent::Assigned(vec![claim.clone()]))
        .await;
    assert_eq!(
        dispatcher.route(record(0, payload(2, "Jeans", 30.0, 1))),
        Routed::Delivered
    );
    committer.wait_for(0).await;

    // The group drops the assignment; nothing for the partition is consumed meanwhile
    dispatcher
        .handle_rebalance(RebalanceEvent::Error("group coordinator lost".to_string()))
        .await;
    assert_eq!(dispatcher.state(&claim), ClaimState::Revoked);
    assert_eq!(
        dispatcher.route(record(1, payload(2, "Jeans", 50.0, 1))),
        Routed::Dropped
    );

    // Reassigned: redelivered from the committed offset and consumed by a fresh task
    dispatcher
        .handle_rebalance(RebalanceEvent::Assigned(vec![claim.clone()]))
        .await;
    assert_eq!(dispatcher.state(&claim), ClaimState::Consuming);
    assert_eq!(
        dispatcher.route(record(1, payload(2, "Jeans", 50.0, 1))),
        Routed::Delivered
    );
    committer.wait_for(1).await;

    dispatcher.drain().await;

    assert_eq!(committer.marked(), vec![0, 1]);
    assert_eq!(
        worker
            .aggregator()
            .store()
            .get("counter:Ropa")
            .await
            .unwrap()
            .as_deref(),
        Some("2")
    );
}
