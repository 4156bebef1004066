use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{KvStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPurpose {
    Ordinary,
    Csrf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Ip,
    Subject,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActorType::Ip => "ip",
            ActorType::Subject => "subject",
        })
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(ActorType::Ip),
            "subject" => Ok(ActorType::Subject),
            other => Err(format!("unknown actor type '{other}'")),
        }
    }
}

/// Who a request is attributed to for limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitActor {
    pub actor_type: ActorType,
    pub value: String,
}

impl RateLimitActor {
    pub fn ip(value: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Ip,
            value: value.into(),
        }
    }

    pub fn subject(value: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Subject,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitKey {
    pub purpose: RateLimitPurpose,
    pub actor: RateLimitActor,
}

impl RateLimitKey {
    pub fn new(purpose: RateLimitPurpose, actor: RateLimitActor) -> Self {
        Self { purpose, actor }
    }

    fn namespace(&self) -> &'static str {
        match self.purpose {
            RateLimitPurpose::Ordinary => "ratelimit",
            RateLimitPurpose::Csrf => "ratelimit:csrf",
        }
    }

    pub fn counter_key(&self, environment: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.namespace(),
            environment,
            self.actor.actor_type,
            self.actor.value
        )
    }

    pub fn block_key(&self, environment: &str) -> String {
        format!(
            "{}:block:{}:{}:{}",
            self.namespace(),
            environment,
            self.actor.actor_type,
            self.actor.value
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub window: Duration,
    pub max_attempts: u32,
    pub block_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Deployment tag baked into every key.
    pub environment: String,
    pub ordinary: RateLimitPolicy,
    pub csrf: RateLimitPolicy,
    pub fail_closed: bool,
}

impl RateLimitConfig {
    pub fn policy(&self, purpose: RateLimitPurpose) -> &RateLimitPolicy {
        match purpose {
            RateLimitPurpose::Ordinary => &self.ordinary,
            RateLimitPurpose::Csrf => &self.csrf,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// The store could not be consulted; `allowed` reflects the fail-open or
    /// fail-closed policy rather than a count.
    pub store_failure: bool,
}

impl RateLimitResult {
    /// Whole seconds until `reset_at`, at least one.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }
}

/// Fixed-window attempt counter with a separate block flag, shared across
/// instances through the store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one attempt against `key` and reports whether it may proceed.
    pub async fn check_and_record(&self, key: &RateLimitKey) -> RateLimitResult {
        let policy = *self.config.policy(key.purpose);
        match self.try_check_and_record(key, &policy).await {
            Ok(result) => result,
            Err(err) => self.policy_outcome(key, &policy, err),
        }
    }

    async fn try_check_and_record(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitResult, StoreError> {
        let env = &self.config.environment;
        let now = self.store.now().await?;

        if let Some(result) = self.blocked(key, now).await? {
            return Ok(result);
        }

        let counter = self
            .store
            .incr_with_ttl(&key.counter_key(env), policy.window)
            .await?;

        if counter.value >= policy.max_attempts as i64 {
            self.store
                .set_ex(&key.block_key(env), "1", policy.block_duration)
                .await?;
            tracing::warn!(
                purpose = ?key.purpose,
                actor_type = %key.actor.actor_type,
                actor = %key.actor.value,
                attempts = counter.value,
                block_secs = policy.block_duration.as_secs(),
                "Rate limit exceeded, blocking"
            );
            return Ok(RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_at: now + to_chrono(policy.block_duration),
                store_failure: false,
            });
        }

        let window_left = counter.ttl.unwrap_or(policy.window);
        Ok(RateLimitResult {
            allowed: true,
            remaining: (policy.max_attempts as i64 - counter.value).max(0) as u32,
            reset_at: now + to_chrono(window_left),
            store_failure: false,
        })
    }

    /// Reports an active block without counting an attempt. `None` means the
    /// key is open.
    pub async fn check_blocked(&self, key: &RateLimitKey) -> Option<RateLimitResult> {
        let policy = *self.config.policy(key.purpose);
        let outcome = async {
            let now = self.store.now().await?;
            self.blocked(key, now).await
        }
        .await;

        match outcome {
            Ok(result) => result,
            Err(err) => {
                let result = self.policy_outcome(key, &policy, err);
                (!result.allowed).then_some(result)
            }
        }
    }

    async fn blocked(
        &self,
        key: &RateLimitKey,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitResult>, StoreError> {
        let ttl = self
            .store
            .ttl(&key.block_key(&self.config.environment))
            .await?;
        Ok(ttl.map(|left| RateLimitResult {
            allowed: false,
            remaining: 0,
            reset_at: now + to_chrono(left),
            store_failure: false,
        }))
    }

    fn policy_outcome(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitPolicy,
        err: StoreError,
    ) -> RateLimitResult {
        tracing::error!(
            error = %err,
            purpose = ?key.purpose,
            actor_type = %key.actor.actor_type,
            fail_closed = self.config.fail_closed,
            "Rate limit store failure"
        );
        RateLimitResult {
            allowed: !self.config.fail_closed,
            remaining: 0,
            reset_at: Utc::now() + to_chrono(policy.window),
            store_failure: true,
        }
    }

    /// Deletes the counter and block flag for `key`.
    pub async fn clear_limit(&self, key: &RateLimitKey) -> Result<(), StoreError> {
        let env = &self.config.environment;
        self.store
            .delete(&[key.counter_key(env), key.block_key(env)])
            .await?;
        tracing::info!(
            purpose = ?key.purpose,
            actor_type = %key.actor.actor_type,
            actor = %key.actor.value,
            "Rate limit cleared"
        );
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MockKvStore};

    fn config(fail_closed: bool) -> RateLimitConfig {
        RateLimitConfig {
            environment: "test".into(),
            ordinary: RateLimitPolicy {
                window: Duration::from_secs(60),
                max_attempts: 5,
                block_duration: Duration::from_secs(300),
            },
            csrf: RateLimitPolicy {
                window: Duration::from_secs(60),
                max_attempts: 3,
                block_duration: Duration::from_secs(120),
            },
            fail_closed,
        }
    }

    fn ip_key(purpose: RateLimitPurpose) -> RateLimitKey {
        RateLimitKey::new(purpose, RateLimitActor::ip("10.0.0.1"))
    }

    #[test]
    fn keys_are_namespaced_by_purpose() {
        let ordinary = ip_key(RateLimitPurpose::Ordinary);
        let csrf = ip_key(RateLimitPurpose::Csrf);
        assert_eq!(ordinary.counter_key("prod"), "ratelimit:prod:ip:10.0.0.1");
        assert_eq!(
            ordinary.block_key("prod"),
            "ratelimit:block:prod:ip:10.0.0.1"
        );
        assert_eq!(csrf.counter_key("prod"), "ratelimit:csrf:prod:ip:10.0.0.1");
        assert_eq!(
            csrf.block_key("prod"),
            "ratelimit:csrf:block:prod:ip:10.0.0.1"
        );
    }

    #[tokio::test]
    async fn remaining_decreases_until_block() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), config(true));
        let key = ip_key(RateLimitPurpose::Ordinary);

        let mut previous = u32::MAX;
        for _ in 0..4 {
            let result = limiter.check_and_record(&key).await;
            assert!(result.allowed);
            assert!(result.remaining < previous);
            previous = result.remaining;
        }
        assert_eq!(previous, 1);

        let fifth = limiter.check_and_record(&key).await;
        assert!(!fifth.allowed);
        assert_eq!(fifth.remaining, 0);
        assert!(!fifth.store_failure);
        assert!(store.get(&key.block_key("test")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn block_outlives_the_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), config(true));
        let key = ip_key(RateLimitPurpose::Ordinary);
        for _ in 0..5 {
            limiter.check_and_record(&key).await;
        }

        store.advance(Duration::from_secs(120)).await;
        let during = limiter.check_and_record(&key).await;
        assert!(!during.allowed);
        assert_eq!(during.remaining, 0);

        store.advance(Duration::from_secs(181)).await;
        let after = limiter.check_and_record(&key).await;
        assert!(after.allowed);
        assert_eq!(after.remaining, 4);
    }

    #[tokio::test]
    async fn reset_time_comes_from_store_clock() {
        let store = Arc::new(MemoryStore::new());
        store.advance(Duration::from_secs(3600)).await;
        let limiter = RateLimiter::new(store.clone(), config(true));
        let result = limiter
            .check_and_record(&ip_key(RateLimitPurpose::Ordinary))
            .await;
        let store_now = store.now().await.unwrap();
        assert!(result.reset_at > store_now + chrono::Duration::seconds(55));
        assert!(result.reset_at <= store_now + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn csrf_purpose_uses_its_own_counter() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, config(true));
        for _ in 0..3 {
            limiter
                .check_and_record(&ip_key(RateLimitPurpose::Csrf))
                .await;
        }
        assert!(limiter
            .check_blocked(&ip_key(RateLimitPurpose::Csrf))
            .await
            .is_some());
        assert!(limiter
            .check_blocked(&ip_key(RateLimitPurpose::Ordinary))
            .await
            .is_none());
        assert!(
            limiter
                .check_and_record(&ip_key(RateLimitPurpose::Ordinary))
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn clear_limit_reopens_a_blocked_key() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store, config(true));
        let key = ip_key(RateLimitPurpose::Ordinary);
        for _ in 0..5 {
            limiter.check_and_record(&key).await;
        }
        limiter.clear_limit(&key).await.unwrap();
        let result = limiter.check_and_record(&key).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn outage_denies_when_fail_closed() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let limiter = RateLimiter::new(store, config(true));
        let key = ip_key(RateLimitPurpose::Ordinary);

        let result = limiter.check_and_record(&key).await;
        assert!(!result.allowed);
        assert!(result.store_failure);
        assert!(limiter.check_blocked(&key).await.is_some());
    }

    #[tokio::test]
    async fn outage_permits_when_fail_open() {
        let mut mock = MockKvStore::new();
        mock.expect_now()
            .returning(|| Err(StoreError::Timeout(Duration::from_millis(500))));
        let limiter = RateLimiter::new(Arc::new(mock), config(false));
        let key = ip_key(RateLimitPurpose::Ordinary);

        let result = limiter.check_and_record(&key).await;
        assert!(result.allowed);
        assert!(result.store_failure);
        assert!(limiter.check_blocked(&key).await.is_none());
    }
}
