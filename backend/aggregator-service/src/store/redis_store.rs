use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, RedisResult, Script};
use redis_utils::{run_with_timeout, SharedConnectionManager};
use std::future::Future;
use std::time::Duration;

use super::{AnalyticsStore, Extremum, StoreError, StreamEntry};

/// Conditional extremum write, evaluated server side so concurrent replicas cannot lose updates.
/// ARGV[1] candidate, ARGV[2] "max" | "min". Returns 1 when written.
const UPDATE_EXTREMUM_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
local candidate = tonumber(ARGV[1])
if current then
    local stored = tonumber(current)
    if stored ~= nil then
        if ARGV[2] == 'max' and candidate <= stored then
            return 0
        end
        if ARGV[2] == 'min' and candidate >= stored then
            return 0
        end
    end
end
redis.call('SET', KEYS[1], ARGV[1])
return 1
"#;

/// Redis-backed store.
///
/// Commands run on a clone of the shared `ConnectionManager` (a multiplexed handle), so the
/// mutex is only held long enough to clone it and partitions never queue behind each other.
pub struct RedisAnalyticsStore {
    manager: SharedConnectionManager,
    command_timeout: Duration,
    extremum_script: Script,
}

impl RedisAnalyticsStore {
    pub fn new(manager: SharedConnectionManager, command_timeout: Duration) -> Self {
        Self {
            manager,
            command_timeout,
            extremum_script: Script::new(UPDATE_EXTREMUM_LUA),
        }
    }

    async fn connection(&self) -> ConnectionManager {
        self.manager.lock().await.clone()
    }

    async fn run<T, F>(&self, key: &str, future: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        run_with_timeout(self.command_timeout, future)
            .await
            .map_err(|e| StoreError::from_redis(key, e))
    }
}

#[async_trait]
impl AnalyticsStore for RedisAnalyticsStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.incr(key, 1i64)).await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.incr(key, delta)).await
    }

    async fn increment_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        // f64 delta makes `incr` issue INCRBYFLOAT
        let mut conn = self.connection().await;
        self.run(key, conn.incr(key, delta)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.set_nx(key, value)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.set(key, value)).await
    }

    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let mut conn = self.connection().await;
        self.run(key, conn.zincr(key, member, delta)).await
    }

    async fn capped_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
    ) -> Result<String, StoreError> {
        let mut conn = self.connection().await;
        self.run(
            key,
            conn.xadd_maxlen(key, StreamMaxlen::Equals(max_len), "*", fields),
        )
        .await
    }

    async fn update_extremum(
        &self,
        key: &str,
        value: f64,
        extremum: Extremum,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await;
        let written: i64 = self
            .run(
                key,
                self.extremum_script
                    .key(key)
                    .arg(value)
                    .arg(extremum.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(written == 1)
    }

    async fn sorted_set_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await;
        self.run(
            key,
            conn.zrevrange_withscores(key, 0, limit as isize - 1),
        )
        .await
    }

    async fn stream_entries(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.connection().await;
        let reply: StreamRangeReply = self.run(key, conn.xrange_all(key)).await?;

        reply
            .ids
            .into_iter()
            .map(|entry| {
                let mut fields = entry
                    .map
                    .iter()
                    .map(|(name, value)| {
                        redis::from_redis_value::<String>(value)
                            .map(|v| (name.clone(), v))
                            .map_err(|e| StoreError::from_redis(key, e))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(StreamEntry {
                    id: entry.id,
                    fields,
                })
            })
            .collect()
    }
}
