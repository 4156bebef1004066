//! Shared key-value store seam.
//!
//! Every component reaches the shared store through [`KvStore`]. The trait
//! exposes the handful of primitives the core needs for both storage and
//! cross-instance coordination: TTL'd strings, conditional writes, atomic
//! counters, a sorted set for range queries, and the server clock.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use redis::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// True when the store could not be reached in time, as opposed to a
    /// reachable store holding bad data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Value and remaining lifetime of a window counter after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: i64,
    pub ttl: Option<Duration>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Server-authoritative wall clock.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Writes only when `key` is absent. Returns whether the write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes every listed key, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Remaining TTL. `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Atomically increments `key`. The increment that creates the key also
    /// gives it `ttl`; later increments leave the expiry untouched.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<Counter>;

    /// Atomic rotation of a value: when `key` currently holds `expected`
    /// (or is absent and `expected` is `None`), the previous value moves to
    /// `demoted_key` with `demoted_ttl` and `key` takes `new_value` with
    /// `ttl`. Returns false, changing nothing, when `key` moved on.
    async fn swap_if_current(
        &self,
        key: &str,
        demoted_key: &str,
        expected: Option<String>,
        new_value: &str,
        ttl: Duration,
        demoted_ttl: Duration,
    ) -> StoreResult<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64)
        -> StoreResult<Vec<(String, f64)>>;

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;
}

/// Converts a chrono duration to a std one, clamping negatives to zero.
pub fn non_negative(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_and_timeout_count_as_outages() {
        assert!(StoreError::Unavailable("down".into()).is_unavailable());
        assert!(StoreError::Timeout(Duration::from_millis(5)).is_unavailable());
        assert!(!StoreError::Corrupt {
            key: "k".into(),
            reason: "bad json".into()
        }
        .is_unavailable());
    }

    #[test]
    fn non_negative_clamps_past_deadlines() {
        assert_eq!(non_negative(chrono::Duration::seconds(-5)), Duration::ZERO);
        assert_eq!(
            non_negative(chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }
}
