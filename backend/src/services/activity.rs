//! Last-seen tracking and derived liveness.
//!
//! Activity lives in one sorted set scored by epoch milliseconds, so "who was
//! active since T" is a single range query. Liveness is never stored; it is
//! recomputed from the score on every read.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::{LivenessState, PresenceEntry};
use crate::store::{KvStore, StoreResult};
use crate::types::SubjectId;

pub const ONLINE_SET_KEY: &str = "presence:online";
/// Lifetime of the connection-id marker written on connect.
pub const CONNECTION_TTL: Duration = Duration::from_secs(3 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub active_threshold: chrono::Duration,
    pub online_threshold: chrono::Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone)]
pub struct ActivityTracker {
    store: Arc<dyn KvStore>,
    config: ActivityConfig,
}

impl ActivityTracker {
    pub fn new(store: Arc<dyn KvStore>, config: ActivityConfig) -> Self {
        Self { store, config }
    }

    fn connection_key(subject_id: &SubjectId) -> String {
        format!("presence:conn:{}", subject_id)
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    pub async fn record_activity(&self, subject_id: &SubjectId) -> StoreResult<()> {
        let now = self.store.now().await?;
        self.store
            .zadd(
                ONLINE_SET_KEY,
                subject_id.as_str(),
                now.timestamp_millis() as f64,
            )
            .await
    }

    pub async fn last_active(&self, subject_id: &SubjectId) -> StoreResult<Option<DateTime<Utc>>> {
        let score = self
            .store
            .zscore(ONLINE_SET_KEY, subject_id.as_str())
            .await?;
        Ok(score.and_then(from_score))
    }

    pub async fn liveness(&self, subject_id: &SubjectId) -> StoreResult<LivenessState> {
        let Some(last_active) = self.last_active(subject_id).await? else {
            return Ok(LivenessState::Offline);
        };
        let now = self.store.now().await?;
        Ok(self.classify(now - last_active))
    }

    fn classify(&self, elapsed: chrono::Duration) -> LivenessState {
        LivenessState::classify(
            elapsed,
            self.config.active_threshold,
            self.config.online_threshold,
        )
    }

    /// Subjects seen within the online threshold, oldest first.
    pub async fn list_online(&self) -> StoreResult<Vec<PresenceEntry>> {
        let now = self.store.now().await?;
        let since = (now - self.config.online_threshold).timestamp_millis() as f64;
        let members = self
            .store
            .zrange_by_score(ONLINE_SET_KEY, since, f64::INFINITY)
            .await?;

        Ok(members
            .into_iter()
            .filter_map(|(member, score)| {
                let last_active = from_score(score)?;
                let state = self.classify(now - last_active);
                (!state.is_offline()).then(|| PresenceEntry {
                    subject_id: SubjectId::new(member),
                    last_active,
                    state,
                })
            })
            .collect())
    }

    pub async fn on_connect(&self, subject_id: &SubjectId, connection_id: &str) -> StoreResult<()> {
        self.store
            .set_ex(
                &Self::connection_key(subject_id),
                connection_id,
                CONNECTION_TTL,
            )
            .await?;
        self.record_activity(subject_id).await?;
        tracing::debug!(%subject_id, connection_id, "Presence connected");
        Ok(())
    }

    /// Clears the connection marker only if it still names this connection.
    /// The activity timestamp is kept so a quick reconnect stays Active.
    pub async fn on_disconnect(
        &self,
        subject_id: &SubjectId,
        connection_id: &str,
    ) -> StoreResult<bool> {
        let cleared = self
            .store
            .delete_if_equals(&Self::connection_key(subject_id), connection_id)
            .await?;
        tracing::debug!(%subject_id, connection_id, cleared, "Presence disconnected");
        Ok(cleared)
    }

    pub async fn connection(&self, subject_id: &SubjectId) -> StoreResult<Option<String>> {
        self.store.get(&Self::connection_key(subject_id)).await
    }

    /// Drops set entries older than the online threshold. Returns how many
    /// were removed.
    pub async fn sweep(&self) -> StoreResult<u64> {
        let now = self.store.now().await?;
        let cutoff = (now - self.config.online_threshold).timestamp_millis() as f64;
        // scores equal to the cutoff are already Offline
        self.store
            .zrem_range_by_score(ONLINE_SET_KEY, f64::NEG_INFINITY, cutoff)
            .await
    }
}

fn from_score(score: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(score as i64).single()
}

/// Handle to the periodic sweep task.
pub struct ActivitySweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActivitySweeper {
    pub fn spawn(tracker: ActivityTracker) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let period = tracker.config.sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = period.as_secs(), "Activity sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match tracker.sweep().await {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(removed, "Swept stale presence entries"),
                            Err(err) => tracing::warn!(error = %err, "Activity sweep failed"),
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Activity sweep stopped");
        });

        Self { stop, task }
    }

    /// Signals the task and waits for it to finish its current iteration.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Activity sweep task panicked");
        }
    }
}
