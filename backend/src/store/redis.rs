use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bb8_redis::redis::{self, AsyncCommands, RedisError};
use chrono::{DateTime, TimeZone, Utc};
use tracing::Instrument;

use super::{Counter, KvStore, StoreError, StoreResult};
use crate::db::redis::RedisPool;

const INCR_WITH_TTL: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return {value, redis.call('PTTL', KEYS[1])}
";

const DELETE_IF_EQUALS: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

// ARGV: has_expected, expected, new_value, ttl_ms, demoted_ttl_ms
const SWAP_IF_CURRENT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
  redis.call('SET', KEYS[2], current, 'PX', ARGV[5])
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
";

/// [`KvStore`] backed by a bb8 pool of Redis connections. Multi-step
/// operations run as Lua scripts so they stay atomic across instances.
pub struct RedisStore {
    pool: RedisPool,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn new(pool: RedisPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn pool_error(err: bb8::RunError<RedisError>) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let (secs, micros): (i64, u32) = redis::cmd("TIME")
                .query_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            Utc.timestamp_opt(secs, micros * 1_000)
                .single()
                .ok_or_else(|| StoreError::Corrupt {
                    key: "TIME".to_string(),
                    reason: format!("out of range timestamp {secs}.{micros}"),
                })
        })
        .instrument(tracing::trace_span!("redis_time"))
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.get::<_, Option<String>>(key)
                .await
                .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_get", key))
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async::<_, ()>(&mut *conn)
                .await
                .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_set_ex", key, ttl_ms = millis(ttl)))
        .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            Ok(reply.is_some())
        })
        .instrument(tracing::debug_span!("redis_set_nx_ex", key))
        .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.del::<_, u64>(keys).await.map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_delete", count = keys.len()))
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let deleted: i64 = redis::Script::new(DELETE_IF_EQUALS)
                .key(key)
                .arg(expected)
                .invoke_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            Ok(deleted == 1)
        })
        .instrument(tracing::debug_span!("redis_delete_if_equals", key))
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            // -2 missing, -1 no expiry
            let pttl: i64 = conn.pttl(key).await.map_err(unavailable)?;
            Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
        })
        .instrument(tracing::debug_span!("redis_ttl", key))
        .await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<Counter> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let (value, pttl): (i64, i64) = redis::Script::new(INCR_WITH_TTL)
                .key(key)
                .arg(millis(ttl))
                .invoke_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            Ok(Counter {
                value,
                ttl: (pttl >= 0).then(|| Duration::from_millis(pttl as u64)),
            })
        })
        .instrument(tracing::debug_span!("redis_incr_with_ttl", key))
        .await
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
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            let has_expected = if expected.is_some() { "1" } else { "0" };
            let swapped: i64 = redis::Script::new(SWAP_IF_CURRENT)
                .key(key)
                .key(demoted_key)
                .arg(has_expected)
                .arg(expected.as_deref().unwrap_or(""))
                .arg(new_value)
                .arg(millis(ttl))
                .arg(millis(demoted_ttl))
                .invoke_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            Ok(swapped == 1)
        })
        .instrument(tracing::debug_span!("redis_swap_if_current", key))
        .await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.zadd::<_, _, _, ()>(key, member, score)
                .await
                .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_zadd", key, member))
        .await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.zscore::<_, _, Option<f64>>(key, member)
                .await
                .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_zscore", key, member))
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.zrangebyscore_withscores::<_, _, _, Vec<(String, f64)>>(
                key,
                score_arg(min),
                score_arg(max),
            )
            .await
            .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_zrange_by_score", key))
        .await
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.bounded(async {
            let mut conn = self.pool.get().await.map_err(pool_error)?;
            conn.zrembyscore::<_, _, _, u64>(key, score_arg(min), score_arg(max))
                .await
                .map_err(unavailable)
        })
        .instrument(tracing::debug_span!("redis_zrem_range_by_score", key))
        .await
    }
}
