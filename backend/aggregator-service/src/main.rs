use aggregator_service::config::{Config, LogFormat};
use aggregator_service::supervisor::Supervisor;
use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,aggregator_service=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    info!(
        "Starting aggregator-service: topic={}, group={}, store={:?}",
        config.kafka_topic, config.kafka_group_id, config.store_backend
    );

    Supervisor::new(config)
        .run()
        .await
        .context("Aggregator terminated with an error")?;

    Ok(())
}
