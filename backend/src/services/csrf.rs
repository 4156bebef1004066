//! Per-session CSRF tokens with rotation and a short grace window.
//!
//! Each session owns up to two live tokens: `csrf:{sid}` (current) and
//! `csrf:old:{sid}` (the previous current, kept for the grace period after a
//! rotation). Rotation is serialized per session by an advisory lock and the
//! actual demote-and-replace is a single conditional write in the store, so
//! concurrent refreshes that present the same token all end up with the one
//! token the winner minted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::models::Session;
use crate::services::activity::ActivityTracker;
use crate::services::session_store::SessionStore;
use crate::store::{non_negative, KvStore, StoreError};
use crate::types::SessionId;
use crate::utils::security::{constant_time_eq, fingerprint, generate_token};

const INITIAL_BACKOFF: Duration = Duration::from_millis(20);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    /// How long a rotated-out token keeps validating.
    pub grace_period: Duration,
    /// Upper bound on a token's TTL regardless of session lifetime.
    pub max_ttl: Duration,
    /// Lifetime of the per-session rotation lock.
    pub lock_ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum CsrfError {
    #[error("session not found")]
    SessionNotFound,
    #[error("presented token is not valid for this session")]
    InvalidToken,
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

struct RotationLock {
    key: String,
    nonce: String,
}

#[derive(Clone)]
pub struct CsrfTokenManager {
    store: Arc<dyn KvStore>,
    sessions: SessionStore,
    activity: ActivityTracker,
    config: CsrfConfig,
}

impl CsrfTokenManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        sessions: SessionStore,
        activity: ActivityTracker,
        config: CsrfConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            activity,
            config,
        }
    }

    fn current_key(session_id: SessionId) -> String {
        format!("csrf:{}", session_id)
    }

    fn old_key(session_id: SessionId) -> String {
        format!("csrf:old:{}", session_id)
    }

    fn lock_key(session_id: SessionId) -> String {
        format!("csrf:lock:{}", session_id)
    }

    fn reissued_key(session_id: SessionId) -> String {
        format!("csrf:rotated:{}", session_id)
    }

    fn token_ttl(&self, session: &Session, now: DateTime<Utc>) -> Duration {
        non_negative(session.expires - now).min(self.config.max_ttl)
    }

    async fn live_session(&self, session_id: SessionId) -> Result<Session, CsrfError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(CsrfError::SessionNotFound)
    }

    /// Mints a fresh current token for a live session, replacing any
    /// existing one without a grace period.
    pub async fn generate(&self, session_id: SessionId) -> Result<String, CsrfError> {
        let session = self.live_session(session_id).await?;
        let now = self.store.now().await?;
        let token = generate_token();
        self.store
            .set_ex(
                &Self::current_key(session_id),
                &token,
                self.token_ttl(&session, now),
            )
            .await?;
        tracing::debug!(%session_id, token = %fingerprint(&token), "CSRF token generated");
        Ok(token)
    }

    /// True when `token` matches the current token, or the previous one
    /// within its grace window, and the session's subject is not Offline.
    pub async fn validate(&self, session_id: SessionId, token: &str) -> Result<bool, CsrfError> {
        if token.is_empty() {
            return Ok(false);
        }
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(false);
        };
        if self.activity.liveness(&session.subject_id).await?.is_offline() {
            tracing::debug!(%session_id, "CSRF rejected, subject offline");
            return Ok(false);
        }

        if let Some(current) = self.store.get(&Self::current_key(session_id)).await? {
            if constant_time_eq(&current, token) {
                return Ok(true);
            }
        }
        if let Some(old) = self.store.get(&Self::old_key(session_id)).await? {
            if constant_time_eq(&old, token) {
                tracing::debug!(%session_id, token = %fingerprint(token), "CSRF accepted in grace window");
                return Ok(true);
            }
        }

        tracing::debug!(%session_id, token = %fingerprint(token), "CSRF token mismatch");
        Ok(false)
    }

    /// Rotates the token the caller presented. Callers racing with the same
    /// token all receive the single token the winner stored.
    pub async fn rotate(&self, session_id: SessionId, presented: &str) -> Result<String, CsrfError> {
        let session = self.live_session(session_id).await?;
        let current_key = Self::current_key(session_id);
        let old_key = Self::old_key(session_id);
        let deadline = Instant::now() + self.config.lock_ttl * 2;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let current = self.store.get(&current_key).await?;
            let old = self.store.get(&old_key).await?;

            let presented_is_current = current
                .as_deref()
                .is_some_and(|current| constant_time_eq(current, presented));
            let presented_is_old = old
                .as_deref()
                .is_some_and(|old| constant_time_eq(old, presented));

            // The two reads are not atomic. Seeing the presented token in
            // both slots means a swap landed between them, so fall through
            // to the CAS, which fails and re-reads.
            if presented_is_old && !presented_is_current {
                if let Some(current) = current {
                    tracing::debug!(%session_id, token = %fingerprint(&current), "Rotation already done, converging");
                    return Ok(current);
                }
            }
            if !presented_is_current {
                return Err(CsrfError::InvalidToken);
            }

            if let Some(lock) = self.try_lock(session_id).await? {
                let now = self.store.now().await;
                let result = match now {
                    Ok(now) => self.swap(&session, current, now).await,
                    Err(err) => Err(err.into()),
                };
                self.unlock(lock).await;
                if let Some(token) = result? {
                    tracing::info!(
                        %session_id,
                        previous = %fingerprint(presented),
                        token = %fingerprint(&token),
                        "CSRF token rotated"
                    );
                    return Ok(token);
                }
                // current moved under us; re-read and converge
            } else {
                backoff = self.wait(session_id, deadline, backoff).await?;
            }

            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(self.config.lock_ttl * 2).into());
            }
        }
    }

    /// Mints a replacement for a caller holding a live session but no usable
    /// token. Concurrent reissues for one session share the first result.
    pub async fn reissue(&self, session_id: SessionId) -> Result<String, CsrfError> {
        let session = self.live_session(session_id).await?;
        let reissued_key = Self::reissued_key(session_id);
        let deadline = Instant::now() + self.config.lock_ttl * 2;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if let Some(token) = self.recent_reissue(session_id).await? {
                return Ok(token);
            }

            if let Some(lock) = self.try_lock(session_id).await? {
                let result = self.reissue_locked(&session, &reissued_key).await;
                self.unlock(lock).await;
                if let Some(token) = result? {
                    tracing::info!(%session_id, token = %fingerprint(&token), "CSRF token reissued");
                    return Ok(token);
                }
            } else {
                backoff = self.wait(session_id, deadline, backoff).await?;
            }

            if Instant::now() >= deadline {
                return Err(StoreError::Timeout(self.config.lock_ttl * 2).into());
            }
        }
    }

    /// Token handed out on refresh: a strict rotation when the caller
    /// presented a usable token, otherwise a reissue.
    pub async fn refresh(
        &self,
        session_id: SessionId,
        presented: Option<&str>,
    ) -> Result<String, CsrfError> {
        match presented {
            Some(token) => match self.rotate(session_id, token).await {
                Err(CsrfError::InvalidToken) => {
                    tracing::debug!(%session_id, "Refresh presented a stale CSRF token, reissuing");
                    self.reissue(session_id).await
                }
                other => other,
            },
            None => self.reissue(session_id).await,
        }
    }

    /// Deletes every token record of the session.
    pub async fn invalidate(&self, session_id: SessionId) -> Result<(), CsrfError> {
        self.store
            .delete(&[
                Self::current_key(session_id),
                Self::old_key(session_id),
                Self::reissued_key(session_id),
            ])
            .await?;
        tracing::debug!(%session_id, "CSRF tokens invalidated");
        Ok(())
    }

    async fn swap(
        &self,
        session: &Session,
        expected: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, CsrfError> {
        let token = generate_token();
        let swapped = self
            .store
            .swap_if_current(
                &Self::current_key(session.session_id),
                &Self::old_key(session.session_id),
                expected,
                &token,
                self.token_ttl(session, now),
                self.config.grace_period,
            )
            .await?;
        Ok(swapped.then_some(token))
    }

    async fn recent_reissue(&self, session_id: SessionId) -> Result<Option<String>, CsrfError> {
        let Some(reissued) = self.store.get(&Self::reissued_key(session_id)).await? else {
            return Ok(None);
        };
        let current = self.store.get(&Self::current_key(session_id)).await?;
        Ok((current.as_deref() == Some(reissued.as_str())).then_some(reissued))
    }

    async fn reissue_locked(
        &self,
        session: &Session,
        reissued_key: &str,
    ) -> Result<Option<String>, CsrfError> {
        if let Some(token) = self.recent_reissue(session.session_id).await? {
            return Ok(Some(token));
        }
        let current = self
            .store
            .get(&Self::current_key(session.session_id))
            .await?;
        let now = self.store.now().await?;
        let Some(token) = self.swap(session, current, now).await? else {
            return Ok(None);
        };
        self.store
            .set_ex(reissued_key, &token, self.config.lock_ttl)
            .await?;
        Ok(Some(token))
    }

    async fn try_lock(&self, session_id: SessionId) -> Result<Option<RotationLock>, CsrfError> {
        let key = Self::lock_key(session_id);
        let nonce = generate_token();
        let acquired = self
            .store
            .set_nx_ex(&key, &nonce, self.config.lock_ttl)
            .await?;
        Ok(acquired.then_some(RotationLock { key, nonce }))
    }

    async fn unlock(&self, lock: RotationLock) {
        // an unreleased lock still expires after lock_ttl
        if let Err(err) = self.store.delete_if_equals(&lock.key, &lock.nonce).await {
            tracing::warn!(key = %lock.key, error = %err, "Failed to release rotation lock");
        }
    }

    async fn wait(
        &self,
        session_id: SessionId,
        deadline: Instant,
        backoff: Duration,
    ) -> Result<Duration, CsrfError> {
        if Instant::now() + backoff > deadline {
            tracing::warn!(%session_id, "Gave up waiting for CSRF rotation lock");
            return Err(StoreError::Timeout(self.config.lock_ttl * 2).into());
        }
        tokio::time::sleep(backoff).await;
        Ok((backoff * 2).min(MAX_BACKOFF))
    }
}
