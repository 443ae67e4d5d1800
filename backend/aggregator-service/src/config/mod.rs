use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    /// In-process store; nothing is persisted. Useful for dry runs against a real topic.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Kafka
    pub kafka_brokers: String,
    pub kafka_topic: String,
    pub kafka_group_id: String,
    pub kafka_session_timeout_ms: u64,
    pub kafka_metadata_timeout_ms: u64,
    pub resubscribe_after_errors: u32,

    // Analytics store
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub redis_command_timeout_ms: u64,
    pub history_max_len: usize,
    pub atomic_extrema: bool,

    // Worker
    pub claim_buffer: usize,

    // Observability
    pub metrics_host: String,
    pub metrics_port: u16,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("kafka_brokers", "localhost:9092")?
            .set_default("kafka_topic", sales_event_schema::DEFAULT_TOPIC)?
            .set_default("kafka_group_id", "sales-aggregator")?
            .set_default("kafka_session_timeout_ms", 10_000)?
            .set_default("kafka_metadata_timeout_ms", 10_000)?
            .set_default("resubscribe_after_errors", 5)?
            .set_default("store_backend", "redis")?
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("redis_command_timeout_ms", redis_utils::DEFAULT_REDIS_COMMAND_TIMEOUT_MS)?
            .set_default("history_max_len", 1000)?
            .set_default("atomic_extrema", true)?
            .set_default("claim_buffer", 256)?
            .set_default("metrics_host", "0.0.0.0")?
            .set_default("metrics_port", 2112)?
            .set_default("log_format", "text")?
            .add_source(config::Environment::default())
            .build()?;

        config.try_deserialize()
    }

    /// Load from the environment and validate.
    pub fn load() -> crate::error::Result<Self> {
        let config = Self::from_env()?;
        config
            .validate()
            .map_err(|e| AppError::Configuration(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka_brokers.trim().is_empty() {
            return Err(anyhow!("KAFKA_BROKERS is required"));
        }

        if self.kafka_topic.trim().is_empty() {
            return Err(anyhow!("KAFKA_TOPIC is required"));
        }

        if self.kafka_group_id.trim().is_empty() {
            return Err(anyhow!("KAFKA_GROUP_ID is required"));
        }

        if self.store_backend == StoreBackend::Redis && self.redis_url.is_empty() {
            return Err(anyhow!("REDIS_URL is required when STORE_BACKEND=redis"));
        }

        if self.history_max_len == 0 {
            return Err(anyhow!("HISTORY_MAX_LEN must be greater than 0"));
        }

        if self.claim_buffer == 0 {
            return Err(anyhow!("CLAIM_BUFFER must be greater than 0"));
        }

        if self.metrics_port == 0 {
            return Err(anyhow!("METRICS_PORT must be greater than 0"));
        }

        if self.resubscribe_after_errors == 0 {
            return Err(anyhow!("RESUBSCRIBE_AFTER_ERRORS must be greater than 0"));
        }

        Ok(())
    }

    /// Per-command Redis deadline, never below 500ms.
    pub fn redis_command_timeout(&self) -> Duration {
        redis_utils::clamp_command_timeout(self.redis_command_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }
}
