use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, TextEncoder};

static PURCHASES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "sales_bridge_purchases_total",
            "Purchase requests handled by the ingestion bridge",
        ),
        &["outcome"],
    )
    .expect("failed to create sales_bridge_purchases_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register sales_bridge_purchases_total");
    counter
});

static PUBLISH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "sales_bridge_publish_duration_seconds",
            "Time to append one sale to the log",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
    )
    .expect("failed to create sales_bridge_publish_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register sales_bridge_publish_duration_seconds");
    histogram
});

pub fn record_purchase(outcome: &str) {
    PURCHASES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_publish(elapsed: Duration) {
    PUBLISH_DURATION_SECONDS.observe(elapsed.as_secs_f64());
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
