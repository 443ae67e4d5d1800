use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sales_event_schema::{DecodeError, SaleEvent};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::coordinator::LogRecord;
use crate::metrics;
use crate::store::{keys, AnalyticsStore, Extremum, StoreError};

/// Aggregator settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Entries kept per price history stream
    pub history_max_len: usize,
    /// Use the store's atomic conditional set for the global extrema instead of get-then-set
    pub atomic_extrema: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_max_len: 1000,
            atomic_extrema: true,
        }
    }
}

/// A store primitive that failed while applying an event.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub operation: &'static str,
    pub key: String,
    pub error: StoreError,
}

/// What applying one event did.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub category: &'static str,
    /// The event's product is the category's monitored product and its price was appended
    pub tracked_sample: bool,
    /// Category counter after the increment, if the increment succeeded
    pub counter: Option<i64>,
    pub failures: Vec<StepFailure>,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<T>(
        &mut self,
        operation: &'static str,
        key: &str,
        result: Result<T, StoreError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(
                    operation,
                    key,
                    category = self.category,
                    error = %error,
                    "Analytics store operation failed, continuing with the next step"
                );
                metrics::record_store_failure(operation);
                self.failures.push(StepFailure {
                    operation,
                    key: key.to_string(),
                    error,
                });
                None
            }
        }
    }
}

#[derive(Debug)]
pub enum RecordOutcome {
    Applied(ApplyReport),
    Dropped(DecodeError),
}

/// Turns sale events into analytics store mutations.
///
/// Every step is attempted even when an earlier one fails: the store offers no transaction,
/// so a partially applied event is the same as a few dropped samples.
pub struct SaleAggregator<S: AnalyticsStore + ?Sized> {
    store: Arc<S>,
    config: AggregatorConfig,
}

impl<S: AnalyticsStore + ?Sized> SaleAggregator<S> {
    pub fn new(store: Arc<S>, config: AggregatorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Decode and apply one record. Undecodable payloads are dropped, never retried.
    pub async fn process_record(&self, record: &LogRecord) -> RecordOutcome {
        let event = match SaleEvent::decode(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping undecodable sale event"
                );
                metrics::record_decode_failure(e.kind());
                return RecordOutcome::Dropped(e);
            }
        };

        let observed_at = record
            .timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let started = Instant::now();
        let report = self.apply(&event, observed_at).await;
        metrics::record_sale(report.category, event.price(), started.elapsed());

        debug!(
            "Processed sale: partition={}, offset={}, category={}, product={}, price={:.2}",
            record.partition,
            record.offset,
            report.category,
            event.product_id(),
            event.price()
        );

        RecordOutcome::Applied(report)
    }

    /// Apply the mutation sequence for one event.
    pub async fn apply(&self, event: &SaleEvent, observed_at: DateTime<Utc>) -> ApplyReport {
        let category = event.category_name();
        let mut report = ApplyReport {
            category,
            ..Default::default()
        };

        self.track_first_seen(event, observed_at, &mut report).await;

        // Counters and sums
        let counter_key = keys::counter(category);
        report.counter = report.record(
            "increment",
            &counter_key,
            self.store.increment(&counter_key).await,
        );

        let sum_quantity_key = keys::sum_quantity(category);
        let sum_quantity = report.record(
            "increment_by",
            &sum_quantity_key,
            self.store
                .increment_by(&sum_quantity_key, i64::from(event.quantity()))
                .await,
        );

        let sum_price_key = keys::sum_price(category);
        let sum_price = report.record(
            "increment_by_float",
            &sum_price_key,
            self.store
                .increment_by_float(&sum_price_key, event.price())
                .await,
        );

        report.record(
            "increment",
            keys::TOTAL_SALES,
            self.store.increment(keys::TOTAL_SALES).await,
        );

        // Averages, only from values this event read back
        if let Some(count) = report.counter.filter(|c| *c > 0) {
            if let Some(sum) = sum_quantity {
                let key = keys::avg_quantity(category);
                let avg = sum as f64 / count as f64;
                let result = self.store.set(&key, &avg.to_string()).await;
                report.record("set", &key, result);
            }
            if let Some(sum) = sum_price {
                let key = keys::avg_price(category);
                let avg = sum / count as f64;
                let result = self.store.set(&key, &avg.to_string()).await;
                report.record("set", &key, result);
            }
        }

        // Rankings
        let quantity = f64::from(event.quantity());
        let ranking_key = keys::ranking(category);
        let result = self
            .store
            .sorted_set_increment(&ranking_key, event.product_id(), quantity)
            .await;
        report.record("sorted_set_increment", &ranking_key, result);

        let result = self
            .store
            .sorted_set_increment(keys::RANKING_GLOBAL, event.product_id(), quantity)
            .await;
        report.record("sorted_set_increment", keys::RANKING_GLOBAL, result);

        // Extrema
        self.update_extremum(keys::MAX_PRICE_GLOBAL, event.price(), Extremum::Max, &mut report)
            .await;
        self.update_extremum(keys::MIN_PRICE_GLOBAL, event.price(), Extremum::Min, &mut report)
            .await;

        report
    }

    async fn track_first_seen(
        &self,
        event: &SaleEvent,
        observed_at: DateTime<Utc>,
        report: &mut ApplyReport,
    ) {
        let category = report.category;
        let monitored_key = keys::monitored_product(category);

        let result = self
            .store
            .set_if_absent(&monitored_key, event.product_id())
            .await;
        if let Some(true) = report.record("set_if_absent", &monitored_key, result) {
            debug!(category, product = event.product_id(), "Monitored product selected");
        }

        let result = self.store.get(&monitored_key).await;
        let monitored = report.record("get", &monitored_key, result).flatten();
        if monitored.as_deref() != Some(event.product_id()) {
            return;
        }

        let history_key = keys::price_history(category);
        let fields = [
            (keys::HISTORY_FIELD_PRICE, event.price().to_string()),
            (keys::HISTORY_FIELD_PRODUCT, event.product_id().to_string()),
            (
                keys::HISTORY_FIELD_TIMESTAMP,
                observed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        ];
        let result = self
            .store
            .capped_append(&history_key, &fields, self.config.history_max_len)
            .await;
        report.tracked_sample = report
            .record("capped_append", &history_key, result)
            .is_some();
    }

    async fn update_extremum(
        &self,
        key: &'static str,
        price: f64,
        extremum: Extremum,
        report: &mut ApplyReport,
    ) {
        if self.config.atomic_extrema {
            let result = self.store.update_extremum(key, price, extremum).await;
            report.record("update_extremum", key, result);
            return;
        }

        // Read-then-write; concurrent writers to the same key can lose an update.
        let result = self.store.get(key).await;
        let current = match report.record("get", key, result) {
            Some(current) => current,
            None => return,
        };

        let should_write = match current.map(|raw| raw.parse::<f64>()) {
            None => true,
            Some(Ok(current)) => extremum.improves(price, current),
            Some(Err(_)) => true,
        };

        if should_write {
            let result = self.store.set(key, &price.to_string()).await;
            report.record("set", key, result);
        }
    }
}
