use axum::{
    extract::{Extension, Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    error::AppError,
    middleware::auth::AuthenticatedSession,
    models::{LivenessState, PresenceEntry},
    state::AppState,
    types::SubjectId,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    pub count: usize,
    pub users: Vec<PresenceEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityStateResponse {
    pub subject_id: SubjectId,
    pub state: LivenessState,
    pub last_active: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConnectionRequest {
    #[validate(length(min = 1, max = 128))]
    pub connection_id: String,
}

pub async fn list_online(State(state): State<AppState>) -> Result<Json<OnlineUsersResponse>, AppError> {
    let users = state.activity.list_online().await?;
    Ok(Json(OnlineUsersResponse {
        count: users.len(),
        users,
    }))
}

pub async fn activity_state(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Result<Json<ActivityStateResponse>, AppError> {
    let subject_id = SubjectId::new(subject_id);
    let last_active = state.activity.last_active(&subject_id).await?;
    let liveness = state.activity.liveness(&subject_id).await?;
    Ok(Json(ActivityStateResponse {
        subject_id,
        state: liveness,
        last_active,
    }))
}

/// Explicit activity ping. The auth layer has already recorded activity, so
/// this just reports the resulting state.
pub async fn ping(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
) -> Result<Json<ActivityStateResponse>, AppError> {
    state.activity.record_activity(&auth.subject_id).await?;
    Ok(Json(ActivityStateResponse {
        last_active: state.activity.last_active(&auth.subject_id).await?,
        state: LivenessState::Active,
        subject_id: auth.subject_id,
    }))
}

pub async fn connect(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
    Json(payload): Json<ConnectionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    payload.validate()?;
    state
        .activity
        .on_connect(&auth.subject_id, &payload.connection_id)
        .await?;
    Ok(Json(serde_json::json!({ "connected": true })))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
    Json(payload): Json<ConnectionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    payload.validate()?;
    let cleared = state
        .activity
        .on_disconnect(&auth.subject_id, &payload.connection_id)
        .await?;
    Ok(Json(serde_json::json!({ "disconnected": cleared })))
}
