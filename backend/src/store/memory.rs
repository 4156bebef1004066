use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Counter, KvStore, StoreError, StoreResult};

/// Expired entries are swept on a write at most this often.
const PURGE_INTERVAL_SECS: i64 = 60;

/// Process-local [`KvStore`].
///
/// Used when no Redis URL is configured and by the test suites. Expiry is
/// lazy: entries past their deadline are dropped when next touched, and
/// writes periodically sweep every expired entry. The clock
/// can be shifted forward with [`MemoryStore::advance`] and the whole store
/// can be switched off with [`MemoryStore::set_available`] to simulate an
/// outage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

#[derive(Default)]
struct Inner {
    offset: chrono::Duration,
    strings: HashMap<String, Entry>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    last_purge: Option<DateTime<Utc>>,
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Inner {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = self.now();
        let expired = self
            .strings
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }

    fn purge_expired(&mut self) {
        let now = self.now();
        let due = self
            .last_purge
            .map_or(true, |last| now - last >= chrono::Duration::seconds(PURGE_INTERVAL_SECS));
        if !due {
            return;
        }
        self.last_purge = Some(now);
        self.strings
            .retain(|_, entry| entry.expires_at.map_or(true, |deadline| deadline > now));
    }

    fn put(&mut self, key: &str, value: &str, ttl: Duration) {
        self.purge_expired();
        let expires_at = self.now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the store clock forward.
    pub async fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().await;
        inner.offset += chrono::Duration::from_std(by).unwrap_or_default();
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.check()?;
        Ok(self.inner.lock().await.now())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key).map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.inner.lock().await.put(key, value, ttl);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Ok(false);
        }
        inner.put(key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for key in keys {
            let existed = inner.live(key).is_some();
            inner.strings.remove(key);
            if inner.sorted_sets.remove(key).is_some() || existed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let matches = inner
            .live(key)
            .is_some_and(|entry| entry.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        Ok(matches)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        Ok(inner
            .live(key)
            .and_then(|entry| entry.expires_at)
            .and_then(|deadline| (deadline - now).to_std().ok()))
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let now = inner.now();
        let counter = match inner.live(key) {
            Some(entry) => {
                let value = entry.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })? + 1;
                entry.value = value.to_string();
                Counter {
                    value,
                    ttl: entry
                        .expires_at
                        .and_then(|deadline| (deadline - now).to_std().ok()),
                }
            }
            None => {
                inner.put(key, "1", ttl);
                Counter {
                    value: 1,
                    ttl: Some(ttl),
                }
            }
        };
        Ok(counter)
    }

    async fn swap_if_current(
        &self,
        key: &str,
        demoted_key: &str,
        expected: Option<String>,
        new_value: &str,
        ttl: Duration,
        demoted_ttl: Duration,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let current = inner.live(key).map(|entry| entry.value.clone());
        if current != expected {
            return Ok(false);
        }
        if let Some(previous) = current {
            inner.put(demoted_key, &previous, demoted_ttl);
        }
        inner.put(key, new_value, ttl);
        Ok(true)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.check()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .sorted_sets
            .get(key)
            .and_then(|set| set.get(member))
            .copied())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut members: Vec<(String, f64)> = inner
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        Ok((before - set.len()) as u64)
    }
}
