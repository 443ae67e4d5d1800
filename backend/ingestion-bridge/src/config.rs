use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    // HTTP server config
    pub http_host: String,
    pub http_port: u16,

    // Kafka
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub publish_timeout_ms: u64,

    // Observability
    pub log_format: String,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("http_host", "0.0.0.0")?
            .set_default("http_port", 8080)?
            .set_default("kafka_brokers", "localhost:9092")?
            .set_default("kafka_topic", sales_event_schema::DEFAULT_TOPIC)?
            .set_default("publish_timeout_ms", 1000)?
            .set_default("log_format", "text")?
            .add_source(config::Environment::default())
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_port == 0 {
            return Err(anyhow!("HTTP_PORT must be greater than 0"));
        }

        if self.kafka_brokers.trim().is_empty() {
            return Err(anyhow!("KAFKA_BROKERS is required"));
        }

        if self.kafka_topic.trim().is_empty() {
            return Err(anyhow!("KAFKA_TOPIC is required"));
        }

        if self.publish_timeout_ms == 0 {
            return Err(anyhow!("PUBLISH_TIMEOUT_MS must be greater than 0"));
        }

        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}
