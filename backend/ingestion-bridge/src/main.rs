use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use ingestion_bridge::config::BridgeConfig;
use ingestion_bridge::handlers::configure_routes;
use ingestion_bridge::{AppState, KafkaSaleLog};
use std::sync::Arc;
use tracing::info;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,actix_web=info,ingestion_bridge=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    let config = BridgeConfig::from_env().context("Failed to load configuration")?;
    init_tracing(config.json_logs());
    config
        .validate()
        .context("Configuration validation failed")?;

    info!("Starting ingestion-bridge");

    let log = KafkaSaleLog::new(
        &config.kafka_brokers,
        &config.kafka_topic,
        config.publish_timeout(),
    )
    .context("Failed to create Kafka producer")?;
    let state = web::Data::new(AppState::new(Arc::new(log), config.publish_timeout()));

    info!(
        "HTTP server listening on {}:{}, publishing to {}",
        config.http_host, config.http_port, config.kafka_topic
    );

    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .bind((config.http_host.as_str(), config.http_port))
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")?;

    Ok(())
}
