//! End-to-end aggregation properties against the in-memory store.

use aggregator_service::services::{AggregatorConfig, SaleAggregator};
use aggregator_service::store::{AnalyticsStore, InMemoryAnalyticsStore};
use chrono::Utc;
use sales_event_schema::SaleEvent;
use std::sync::Arc;
use tokio_test::assert_ok;

fn aggregator(history_max_len: usize) -> SaleAggregator<InMemoryAnalyticsStore> {
    SaleAggregator::new(
        Arc::new(InMemoryAnalyticsStore::new()),
        AggregatorConfig {
            history_max_len,
            atomic_extrema: true,
        },
    )
}

fn sale(category: i32, product: &str, price: f64, quantity: u32) -> SaleEvent {
    SaleEvent::new(category, product, price, quantity).unwrap()
}

async fn number(store: &InMemoryAnalyticsStore, key: &str) -> f64 {
    store
        .get(key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{} is not set", key))
        .parse()
        .unwrap()
}

#[tokio::test]
async fn test_belleza_scenario() {
    let agg = aggregator(1000);
    for event in [
        sale(4, "P1", 10.0, 2),
        sale(4, "P2", 30.0, 1),
        sale(4, "P1", 20.0, 3),
    ] {
        agg.apply(&event, Utc::now()).await;
    }

    let store = agg.store();
    assert_eq!(number(store, "counter:Belleza").await, 3.0);
    assert_eq!(number(store, "promedio_precio:Belleza").await, 20.0);
    assert_eq!(number(store, "promedio_productos:Belleza").await, 2.0);
    assert_eq!(
        store
            .get("producto_monitoreado_nombre:Belleza")
            .await
            .unwrap()
            .as_deref(),
        Some("P1")
    );

    let history = store
        .stream_entries("stream_precio_producto_unico:Belleza")
        .await
        .unwrap();
    let prices: Vec<_> = history.iter().filter_map(|e| e.field("precio")).collect();
    assert_eq!(prices, vec!["10", "20"]);
    assert!(history.iter().all(|e| e.field("producto") == Some("P1")));

    let ranking = store
        .sorted_set_desc("ranking_productos_cat:Belleza", 10)
        .await
        .unwrap();
    assert_eq!(
        ranking,
        vec![("P1".to_string(), 5.0), ("P2".to_string(), 1.0)]
    );

    assert!(number(store, "precio_max_global").await >= 30.0);
    assert!(number(store, "precio_min_global").await <= 10.0);
}

#[tokio::test]
async fn test_counter_and_averages_match_inputs() {
    let agg = aggregator(1000);
    let prices = [12.5, 80.0, 3.25, 44.0, 19.99, 100.0];
    let quantities = [1u32, 4, 2, 7, 1, 3];

    for (i, (price, qty)) in prices.iter().zip(quantities.iter()).enumerate() {
        agg.apply(&sale(1, &format!("SKU-{}", i), *price, *qty), Utc::now())
            .await;
    }

    let store = agg.store();
    let n = prices.len() as f64;
    let mean_price = prices.iter().sum::<f64>() / n;
    let mean_qty = quantities.iter().map(|q| f64::from(*q)).sum::<f64>() / n;

    assert_eq!(number(store, "counter:Electronica").await, n);
    assert!((number(store, "promedio_precio:Electronica").await - mean_price).abs() < 1e-9);
    assert!((number(store, "promedio_productos:Electronica").await - mean_qty).abs() < 1e-9);
    assert_eq!(number(store, "total_ventas").await, n);
}

#[tokio::test]
async fn test_global_extrema_span_categories() {
    let agg = aggregator(1000);
    let events = [
        sale(1, "TV", 1500.0, 1),
        sale(2, "Calcetines", 2.5, 10),
        sale(3, "Lampara", 75.0, 1),
        sale(9, "Misc", 0.99, 1),
        sale(4, "Perfume", 220.0, 2),
    ];
    for event in &events {
        agg.apply(event, Utc::now()).await;
    }

    assert_eq!(number(agg.store(), "precio_max_global").await, 1500.0);
    assert_eq!(number(agg.store(), "precio_min_global").await, 0.99);
}

#[tokio::test]
async fn test_monitored_product_is_write_once() {
    let agg = aggregator(1000);
    agg.apply(&sale(2, "Camisa", 25.0, 1), Utc::now()).await;
    for product in ["Pantalon", "Chaqueta", "Zapatos"] {
        let report = agg.apply(&sale(2, product, 50.0, 1), Utc::now()).await;
        assert!(!report.tracked_sample);
    }
    let report = agg.apply(&sale(2, "Camisa", 27.0, 1), Utc::now()).await;
    assert!(report.tracked_sample);

    let store = agg.store();
    assert_eq!(
        store
            .get("producto_monitoreado_nombre:Ropa")
            .await
            .unwrap()
            .as_deref(),
        Some("Camisa")
    );
    assert_eq!(
        store
            .stream_entries("stream_precio_producto_unico:Ropa")
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_history_keeps_most_recent_entries() {
    let agg = aggregator(5);
    for i in 0..12 {
        agg.apply(&sale(3, "Sofa", 100.0 + f64::from(i), 1), Utc::now())
            .await;
    }

    let history = agg
        .store()
        .stream_entries("stream_precio_producto_unico:Hogar")
        .await
        .unwrap();
    let prices: Vec<_> = history.iter().filter_map(|e| e.field("precio")).collect();
    assert_eq!(prices, vec!["107", "108", "109", "110", "111"]);
}

#[tokio::test]
async fn test_global_ranking_sums_across_categories() {
    let agg = aggregator(1000);
    agg.apply(&sale(1, "Regalo", 10.0, 2), Utc::now()).await;
    agg.apply(&sale(4, "Regalo", 10.0, 5), Utc::now()).await;
    agg.apply(&sale(3, "Regalo", 10.0, 1), Utc::now()).await;
    agg.apply(&sale(3, "Otro", 10.0, 3), Utc::now()).await;

    let global = agg
        .store()
        .sorted_set_desc("ranking_productos", 10)
        .await
        .unwrap();
    assert_eq!(
        global,
        vec![("Regalo".to_string(), 8.0), ("Otro".to_string(), 3.0)]
    );
}

/// Redelivery is applied twice: at-least-once, not exactly-once.
#[tokio::test]
async fn test_redelivered_event_is_double_counted() {
    let agg = aggregator(1000);
    let event = sale(4, "Labial", 15.0, 2);

    agg.apply(&event, Utc::now()).await;
    agg.apply(&event, Utc::now()).await;

    let store = agg.store();
    assert_eq!(number(store, "counter:Belleza").await, 2.0);
    assert_eq!(number(store, "suma_cantidad:Belleza").await, 4.0);
    assert_eq!(
        store
            .sorted_set_desc("ranking_productos_cat:Belleza", 1)
            .await
            .unwrap(),
        vec![("Labial".to_string(), 4.0)]
    );
    // Averages stay correct because both sums and the counter double
    assert_eq!(number(store, "promedio_precio:Belleza").await, 15.0);
}

#[tokio::test]
async fn test_concurrent_partitions_keep_exact_extrema() {
    let agg = Arc::new(aggregator(1000));
    let mut handles = Vec::new();

    for partition in 0..8 {
        let agg = agg.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let price = f64::from(partition * 100 + i) + 1.0;
                agg.apply(&sale(1 + partition % 4, "Item", price, 1), Utc::now())
                    .await;
            }
        }));
    }
    for handle in handles {
        assert_ok!(handle.await);
    }

    let store = agg.store();
    assert_eq!(number(store, "precio_max_global").await, 725.0);
    assert_eq!(number(store, "precio_min_global").await, 1.0);
    assert_eq!(number(store, "total_ventas").await, 200.0);
}
