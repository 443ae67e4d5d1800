//! Analytics store client
//!
//! [`AnalyticsStore`] exposes the primitives the aggregator composes. Each primitive is atomic
//! on its own; nothing here spans several keys.

use async_trait::async_trait;
use redis::RedisError;
use thiserror::Error;

pub mod keys;
pub mod memory;
pub mod redis_store;

pub use self::memory::InMemoryAnalyticsStore;
pub use self::redis_store::RedisAnalyticsStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Network, backend or timeout failure. The caller may skip or retry.
    #[error("analytics store unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of another type, or one that does not parse.
    #[error("wrong type at `{key}`: {reason}")]
    Type { key: String, reason: String },
}

impl StoreError {
    pub fn from_redis(key: &str, err: RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError
            || err.code() == Some("WRONGTYPE")
            || is_value_error(&err)
        {
            StoreError::Type {
                key: key.to_string(),
                reason: err.to_string(),
            }
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// `ERR` replies caused by the stored value, e.g. `INCR` on a non-integer string.
fn is_value_error(err: &RedisError) -> bool {
    const VALUE_ERRORS: &[&str] = &["not an integer", "not a valid float", "overflow"];

    err.kind() == redis::ErrorKind::ResponseError
        && err
            .detail()
            .map_or(false, |detail| VALUE_ERRORS.iter().any(|m| detail.contains(m)))
}

/// Which side of a running extremum to maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extremum {
    Max,
    Min,
}

impl Extremum {
    /// Whether `candidate` should replace `current`.
    pub fn improves(self, candidate: f64, current: f64) -> bool {
        match self {
            Extremum::Max => candidate > current,
            Extremum::Min => candidate < current,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Extremum::Max => "max",
            Extremum::Min => "min",
        }
    }
}

/// One entry of a capped stream, oldest first when listed.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// `INCR`: returns the new value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    async fn increment_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError>;

    /// First writer wins. Returns whether this call stored the value.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Adds `delta` to `member`'s score and returns the new score.
    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError>;

    /// Append `fields` as one entry and trim the stream to the newest `max_len` entries.
    /// Returns the entry id.
    async fn capped_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
    ) -> Result<String, StoreError>;

    /// Store `value` if the key is absent or `value` beats the stored number, atomically.
    /// Returns whether the key was written.
    async fn update_extremum(
        &self,
        key: &str,
        value: f64,
        extremum: Extremum,
    ) -> Result<bool, StoreError>;

    /// Members by descending score, at most `limit`.
    async fn sorted_set_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    async fn stream_entries(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError>;
}
