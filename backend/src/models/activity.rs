use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SubjectId;

/// Three-level activity classification, always derived from the age of the
/// last recorded activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    Active,
    Online,
    Offline,
}

impl LivenessState {
    /// `elapsed < active` is Active, `elapsed < online` is Online, anything
    /// older is Offline.
    pub fn classify(elapsed: Duration, active: Duration, online: Duration) -> Self {
        if elapsed < active {
            LivenessState::Active
        } else if elapsed < online {
            LivenessState::Online
        } else {
            LivenessState::Offline
        }
    }

    pub fn is_offline(self) -> bool {
        self == LivenessState::Offline
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub subject_id: SubjectId,
    pub last_active: DateTime<Utc>,
    pub state: LivenessState,
}
