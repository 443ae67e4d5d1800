use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    TextEncoder,
};
use sales_event_schema::CATEGORY_TABLE;

/// Sales processed per category (dashboard-facing name kept stable).
static SALES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "blackfriday_ventas_total",
            "Total number of sales processed per category",
        ),
        &["categoria"],
    )
    .expect("failed to create blackfriday_ventas_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register blackfriday_ventas_total");
    counter
});

static REVENUE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    let counter = CounterVec::new(
        Opts::new(
            "blackfriday_ingresos_total",
            "Sum of sale prices processed per category",
        ),
        &["categoria"],
    )
    .expect("failed to create blackfriday_ingresos_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register blackfriday_ingresos_total");
    counter
});

static DECODE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sales_aggregator_decode_failures_total",
            "Sale events dropped because the payload could not be decoded",
        ),
        &["kind"],
    )
    .expect("failed to create sales_aggregator_decode_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_aggregator_decode_failures_total");
    counter
});

static STORE_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sales_aggregator_store_failures_total",
            "Analytics store mutations that failed and were skipped",
        ),
        &["operation"],
    )
    .expect("failed to create sales_aggregator_store_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_aggregator_store_failures_total");
    counter
});

static OFFSET_COMMIT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "sales_aggregator_offset_commit_failures_total",
        "Offset store or commit calls rejected by the consumer",
    )
    .expect("failed to create sales_aggregator_offset_commit_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_aggregator_offset_commit_failures_total");
    counter
});

static CONSUMER_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "sales_aggregator_consumer_errors_total",
        "Errors returned while polling the sales topic",
    )
    .expect("failed to create sales_aggregator_consumer_errors_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_aggregator_consumer_errors_total");
    counter
});

static ACTIVE_CLAIMS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "sales_aggregator_active_claims",
        "Partitions currently claimed by this replica",
    )
    .expect("failed to create sales_aggregator_active_claims");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register sales_aggregator_active_claims");
    gauge
});

static REBALANCES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sales_aggregator_rebalances_total",
            "Consumer group rebalance callbacks by kind",
        ),
        &["kind"],
    )
    .expect("failed to create sales_aggregator_rebalances_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_aggregator_rebalances_total");
    counter
});

static EVENT_PROCESSING_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sales_aggregator_event_processing_seconds",
            "Time spent applying one sale event to the analytics store",
        )
        .buckets(vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0]),
    )
    .expect("failed to create sales_aggregator_event_processing_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register sales_aggregator_event_processing_seconds");
    histogram
});

/// Create the per-category sale series at zero, so every category is exported before its
/// first sale.
pub fn seed_categories() {
    let names = CATEGORY_TABLE
        .iter()
        .map(|(_, name)| name)
        .chain(std::iter::once(CATEGORY_TABLE.fallback()));
    for name in names {
        let _ = SALES_TOTAL.with_label_values(&[name]);
        let _ = REVENUE_TOTAL.with_label_values(&[name]);
    }
}

pub fn record_sale(category: &str, price: f64, elapsed: Duration) {
    SALES_TOTAL.with_label_values(&[category]).inc();
    REVENUE_TOTAL.with_label_values(&[category]).inc_by(price);
    EVENT_PROCESSING_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_decode_failure(kind: &str) {
    DECODE_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_store_failure(operation: &str) {
    STORE_FAILURES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_offset_commit_failure() {
    OFFSET_COMMIT_FAILURES_TOTAL.inc();
}

pub fn record_consumer_error() {
    CONSUMER_ERRORS_TOTAL.inc();
}

pub fn record_rebalance(kind: &str) {
    REBALANCES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn set_active_claims(count: usize) {
    ACTIVE_CLAIMS.set(count as i64);
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
