use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::info;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

pub const DEFAULT_REDIS_COMMAND_TIMEOUT_MS: u64 = 3_000;
const MIN_REDIS_COMMAND_TIMEOUT_MS: u64 = 500;

/// Redis connection with reconnect handled by `ConnectionManager`.
pub struct RedisPool {
    manager: SharedConnectionManager,
    address: String,
}

impl RedisPool {
    /// Open the connection and verify the server answers `PING`.
    pub async fn connect(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let address = info.addr.to_string();

        let client = Client::open(info).context("failed to construct Redis client")?;
        let mut connection_manager = run_with_timeout(command_timeout, ConnectionManager::new(client))
            .await
            .context("failed to initialize Redis connection manager")?;

        let pong: String = run_with_timeout(
            command_timeout,
            redis::cmd("PING").query_async(&mut connection_manager),
        )
        .await
        .context("Redis did not answer PING")?;

        info!(address = %address, reply = %pong, "Connected to Redis");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
            address,
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Floor a configured command timeout at 500ms.
pub fn clamp_command_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.max(MIN_REDIS_COMMAND_TIMEOUT_MS))
}

/// Bound a Redis future; elapsing maps to an `IoError` so callers treat it as unavailable.
pub async fn run_with_timeout<F, T>(limit: Duration, future: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match timeout(limit, future).await {
        Ok(res) => res,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}
