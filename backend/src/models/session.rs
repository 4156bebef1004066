use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::LivenessState;
use crate::types::{SessionId, SubjectId};

/// Identity provider a session was established through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    Discord,
    Google,
    Facebook,
    PlatformDev,
}

/// Server-side record of an authenticated login, stored as JSON under
/// `session:{session_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    /// Account id on the game platform.
    pub platform_id: String,
    /// Platform login ticket, revalidated on refresh.
    pub platform_ticket: String,
    pub session_token: String,
    pub access_token: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub auth_source: AuthSource,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires <= now
    }

    pub fn summary(&self, liveness: LivenessState) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            subject_id: self.subject_id.clone(),
            platform_id: self.platform_id.clone(),
            display_name: self.display_name.clone(),
            created: self.created,
            expires: self.expires,
            last_active: self.last_active,
            auth_source: self.auth_source,
            liveness,
        }
    }
}

/// Client-facing view of a session. Never includes the stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    pub platform_id: String,
    pub display_name: Option<String>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub auth_source: AuthSource,
    pub liveness: LivenessState,
}
