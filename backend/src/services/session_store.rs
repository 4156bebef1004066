use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::Instrument;

use crate::models::Session;
use crate::store::{non_negative, KvStore, StoreError, StoreResult};
use crate::types::SessionId;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a session from login.
    pub expiration: Duration,
}

/// Persists sessions as JSON with a store TTL that tracks `expires`.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    fn session_key(session_id: SessionId) -> String {
        format!("session:{}", session_id)
    }

    pub fn expiration(&self) -> Duration {
        self.config.expiration
    }

    /// Store clock, so session timestamps agree across instances.
    pub async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.store.now().await
    }

    /// Returns the live session, purging it when it has expired. A record
    /// that no longer deserializes is purged the same way.
    pub async fn get(&self, session_id: SessionId) -> StoreResult<Option<Session>> {
        let key = Self::session_key(session_id);
        async {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(None);
            };

            let session: Session = match serde_json::from_str(&raw) {
                Ok(session) => session,
                Err(err) => {
                    tracing::error!(error = %err, "Dropping unreadable session record");
                    self.store.delete(&[key.clone()]).await?;
                    return Ok(None);
                }
            };

            let now = self.store.now().await?;
            if session.is_expired_at(now) {
                tracing::debug!(expires = %session.expires, "Session expired, purging");
                self.store.delete(&[key.clone()]).await?;
                return Ok(None);
            }
            Ok(Some(session))
        }
        .instrument(tracing::debug_span!("session_get", %session_id))
        .await
    }

    /// Writes the session with a TTL equal to its remaining lifetime. Saving
    /// an already-expired session is skipped with a warning.
    pub async fn save(&self, session: &Session) -> StoreResult<()> {
        let now = self.store.now().await?;
        if session.is_expired_at(now) {
            tracing::warn!(
                session_id = %session.session_id,
                expires = %session.expires,
                "Refusing to save expired session"
            );
            return Ok(());
        }

        let payload = serde_json::to_string(session).map_err(|e| StoreError::Corrupt {
            key: Self::session_key(session.session_id),
            reason: e.to_string(),
        })?;
        self.store
            .set_ex(
                &Self::session_key(session.session_id),
                &payload,
                non_negative(session.expires - now),
            )
            .await
    }

    pub async fn remove(&self, session_id: SessionId) -> StoreResult<()> {
        self.store.delete(&[Self::session_key(session_id)]).await?;
        Ok(())
    }

    /// Bumps `last_active` and persists. Returns the updated session, or
    /// `None` when it is gone.
    pub async fn touch(&self, session_id: SessionId) -> StoreResult<Option<Session>> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(None);
        };
        session.last_active = self.store.now().await?;
        self.save(&session).await?;
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthSource;
    use crate::store::{MemoryStore, MockKvStore};

    fn session_expiring(now: DateTime<Utc>, lifetime: Duration) -> Session {
        Session {
            session_id: SessionId::new(),
            subject_id: "user-1".into(),
            platform_id: "P-1".into(),
            platform_ticket: "ticket".into(),
            session_token: "st".into(),
            access_token: "at".into(),
            display_name: Some("Player".into()),
            created: now,
            expires: now + lifetime,
            last_active: now,
            auth_source: AuthSource::Google,
        }
    }

    fn sessions(store: Arc<MemoryStore>) -> SessionStore {
        SessionStore::new(
            store,
            SessionConfig {
                expiration: Duration::days(3),
            },
        )
    }

    #[tokio::test]
    async fn saved_session_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let sessions = sessions(store.clone());
        let now = store.now().await.unwrap();
        let session = session_expiring(now, Duration::hours(1));

        sessions.save(&session).await.unwrap();
        let loaded = sessions.get(session.session_id).await.unwrap();
        assert_eq!(loaded, Some(session));
    }

    #[tokio::test]
    async fn expired_session_is_not_found_and_purged() {
        let store = Arc::new(MemoryStore::new());
        let sessions = sessions(store.clone());
        let now = store.now().await.unwrap();
        let session = session_expiring(now, Duration::hours(1));
        let key = SessionStore::session_key(session.session_id);

        // write directly with a longer TTL than `expires` to observe the purge
        store
            .set_ex(
                &key,
                &serde_json::to_string(&session).unwrap(),
                std::time::Duration::from_secs(7200),
            )
            .await
            .unwrap();
        store.advance(std::time::Duration::from_secs(3600)).await;

        assert_eq!(sessions.get(session.session_id).await.unwrap(), None);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn saving_an_expired_session_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let sessions = sessions(store.clone());
        let now = store.now().await.unwrap();
        let session = session_expiring(now, Duration::seconds(-1));

        sessions.save(&session).await.unwrap();
        assert_eq!(
            store
                .get(&SessionStore::session_key(session.session_id))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn store_ttl_tracks_expiry() {
        let store = Arc::new(MemoryStore::new());
        let sessions = sessions(store.clone());
        let now = store.now().await.unwrap();
        let session = session_expiring(now, Duration::minutes(10));
        sessions.save(&session).await.unwrap();

        let ttl = store
            .ttl(&SessionStore::session_key(session.session_id))
            .await
            .unwrap()
            .unwrap();
        assert!(ttl <= std::time::Duration::from_secs(600));
        assert!(ttl > std::time::Duration::from_secs(590));
    }

    #[tokio::test]
    async fn touch_updates_last_active() {
        let store = Arc::new(MemoryStore::new());
        let sessions = sessions(store.clone());
        let now = store.now().await.unwrap();
        let session = session_expiring(now, Duration::hours(1));
        sessions.save(&session).await.unwrap();

        store.advance(std::time::Duration::from_secs(120)).await;
        let touched = sessions.touch(session.session_id).await.unwrap().unwrap();
        assert!(touched.last_active >= now + Duration::seconds(120));

        sessions.remove(session.session_id).await.unwrap();
        assert!(sessions.touch(session.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_record_is_dropped() {
        let mut mock = MockKvStore::new();
        mock.expect_get()
            .returning(|_| Ok(Some("{not json".to_string())));
        mock.expect_delete().times(1).returning(|keys| {
            assert!(keys[0].starts_with("session:"));
            Ok(1)
        });
        let sessions = SessionStore::new(
            Arc::new(mock),
            SessionConfig {
                expiration: Duration::days(3),
            },
        );
        assert!(sessions.get(SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let mut mock = MockKvStore::new();
        mock.expect_get()
            .returning(|_| Err(StoreError::Unavailable("down".into())));
        let sessions = SessionStore::new(
            Arc::new(mock),
            SessionConfig {
                expiration: Duration::days(3),
            },
        );
        let err = sessions.get(SessionId::new()).await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
