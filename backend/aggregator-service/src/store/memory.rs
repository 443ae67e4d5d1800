use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{AnalyticsStore, Extremum, StoreError, StreamEntry};

enum Value {
    Str(String),
    SortedSet(HashMap<String, f64>),
    Stream(VecDeque<StreamEntry>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::SortedSet(_) => "zset",
            Value::Stream(_) => "stream",
        }
    }
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Value>,
    next_stream_seq: u64,
}

/// In-process store with the same per-operation semantics as the Redis one.
///
/// Every operation runs under a single lock, so each is atomic. `fail_next(n)` makes the next
/// `n` calls return `StoreError::Unavailable`.
#[derive(Default)]
pub struct InMemoryAnalyticsStore {
    inner: Mutex<Inner>,
    failures_pending: AtomicUsize,
}

fn wrong_type(key: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Type {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl InMemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations with `Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.values.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn read_number<T: std::str::FromStr>(inner: &Inner, key: &str) -> Result<Option<T>, StoreError> {
        match inner.values.get(key) {
            None => Ok(None),
            Some(Value::Str(raw)) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| wrong_type(key, format!("value `{}` is not a number", raw))),
            Some(other) => Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        }
    }
}

#[async_trait]
impl AnalyticsStore for InMemoryAnalyticsStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.increment_by(key, 1).await
    }

    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let current = Self::read_number::<i64>(&inner, key)?.unwrap_or(0);
        let next = current
            .checked_add(delta)
            .ok_or_else(|| wrong_type(key, "increment would overflow"))?;
        inner.values.insert(key.to_string(), Value::Str(next.to_string()));
        Ok(next)
    }

    async fn increment_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        let mut inner = self.lock()?;
        let current = Self::read_number::<f64>(&inner, key)?.unwrap_or(0.0);
        let next = current + delta;
        inner.values.insert(key.to_string(), Value::Str(next.to_string()));
        Ok(next)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(key.to_string(), Value::Str(value.to_string()));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        match inner.values.get(key) {
            None => Ok(None),
            Some(Value::Str(raw)) => Ok(Some(raw.clone())),
            Some(other) => Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.values.insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let mut inner = self.lock()?;
        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::SortedSet(HashMap::new()));
        match entry {
            Value::SortedSet(members) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            other => Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        }
    }

    async fn capped_append(
        &self,
        key: &str,
        fields: &[(&str, String)],
        max_len: usize,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock()?;
        inner.next_stream_seq += 1;
        let id = format!("0-{}", inner.next_stream_seq);

        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Stream(VecDeque::new()));
        match entry {
            Value::Stream(entries) => {
                entries.push_back(StreamEntry {
                    id: id.clone(),
                    fields: fields
                        .iter()
                        .map(|(name, value)| (name.to_string(), value.clone()))
                        .collect(),
                });
                while entries.len() > max_len {
                    entries.pop_front();
                }
                Ok(id)
            }
            other => Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        }
    }

    async fn update_extremum(
        &self,
        key: &str,
        value: f64,
        extremum: Extremum,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let write = match Self::read_number::<f64>(&inner, key) {
            Ok(Some(current)) => extremum.improves(value, current),
            Ok(None) => true,
            // Unparseable strings are overwritten, same as the server-side script.
            Err(StoreError::Type { .. }) if matches!(inner.values.get(key), Some(Value::Str(_))) => {
                true
            }
            Err(e) => return Err(e),
        };
        if write {
            inner.values.insert(key.to_string(), Value::Str(value.to_string()));
        }
        Ok(write)
    }

    async fn sorted_set_desc(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let inner = self.lock()?;
        let mut members: Vec<(String, f64)> = match inner.values.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::SortedSet(members)) => {
                members.iter().map(|(m, s)| (m.clone(), *s)).collect()
            }
            Some(other) => return Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        };
        // Redis orders equal scores by member, reversed for ZREVRANGE.
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        members.truncate(limit);
        Ok(members)
    }

    async fn stream_entries(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError> {
        let inner = self.lock()?;
        match inner.values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Stream(entries)) => Ok(entries.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, format!("key holds a {}", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_is_first_writer_wins() {
        let store = InMemoryAnalyticsStore::new();

        assert!(store.set_if_absent("k", "first").await.unwrap());
        assert!(!store.set_if_absent("k", "second").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_increments() {
        let store = InMemoryAnalyticsStore::new();

        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment_by("c", 4).await.unwrap(), 5);
        assert_eq!(store.increment_by_float("f", 1.5).await.unwrap(), 1.5);
        assert_eq!(store.increment_by_float("f", 2.0).await.unwrap(), 3.5);
        assert!(matches!(
            store.increment("f").await,
            Err(StoreError::Type { .. })
        ));
    }

    #[tokio::test]
    async fn test_capped_append_drops_oldest() {
        let store = InMemoryAnalyticsStore::new();

        for i in 0..5 {
            store
                .capped_append("s", &[("n", i.to_string())], 3)
                .await
                .unwrap();
        }

        let entries = store.stream_entries("s").await.unwrap();
        let values: Vec<_> = entries.iter().filter_map(|e| e.field("n")).collect();
        assert_eq!(values, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_sorted_set_desc_order() {
        let store = InMemoryAnalyticsStore::new();

        store.sorted_set_increment("z", "a", 1.0).await.unwrap();
        store.sorted_set_increment("z", "b", 5.0).await.unwrap();
        store.sorted_set_increment("z", "a", 2.0).await.unwrap();

        let ranked = store.sorted_set_desc("z", 10).await.unwrap();
        assert_eq!(ranked, vec![("b".to_string(), 5.0), ("a".to_string(), 3.0)]);
        assert_eq!(store.sorted_set_desc("z", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_extremum() {
        let store = InMemoryAnalyticsStore::new();

        assert!(store.update_extremum("max", 10.0, Extremum::Max).await.unwrap());
        assert!(!store.update_extremum("max", 5.0, Extremum::Max).await.unwrap());
        assert!(store.update_extremum("max", 12.5, Extremum::Max).await.unwrap());
        assert_eq!(store.get("max").await.unwrap().as_deref(), Some("12.5"));

        assert!(store.update_extremum("min", 10.0, Extremum::Min).await.unwrap());
        assert!(store.update_extremum("min", 2.0, Extremum::Min).await.unwrap());
        assert!(!store.update_extremum("min", 3.0, Extremum::Min).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_next_injects_unavailable() {
        let store = InMemoryAnalyticsStore::new();
        store.fail_next(2);

        assert!(store.increment("c").await.unwrap_err().is_unavailable());
        assert!(store.get("c").await.unwrap_err().is_unavailable());
        assert_eq!(store.increment("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type_on_mixed_use() {
        let store = InMemoryAnalyticsStore::new();
        store.sorted_set_increment("z", "a", 1.0).await.unwrap();

        assert!(matches!(store.get("z").await, Err(StoreError::Type { .. })));
        assert!(matches!(
            store.capped_append("z", &[], 10).await,
            Err(StoreError::Type { .. })
        ));
    }
}
