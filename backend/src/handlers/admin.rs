use axum::{extract::State, http::HeaderMap, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::{
    error::AppError,
    services::rate_limit::{ActorType, RateLimitActor, RateLimitPurpose},
    services::RateLimitKey,
    state::AppState,
    utils::security::constant_time_eq,
};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Debug, Deserialize, Validate)]
pub struct ClearRateLimitRequest {
    pub purpose: RateLimitPurpose,
    pub actor_type: ActorType,
    #[validate(length(min = 1, max = 256))]
    pub actor: String,
}

/// Administrative reset of one rate-limit key. The route does not exist
/// unless an admin key is configured.
pub async fn clear_rate_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ClearRateLimitRequest>,
) -> Result<Json<Value>, AppError> {
    let Some(expected) = state.config.admin_api_key.as_deref() else {
        return Err(AppError::NotFound("Not found".to_string()));
    };
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(expected, presented) {
        tracing::warn!("Rejected admin request with bad key");
        return Err(AppError::unauthorized("unauthorized", "Invalid admin key"));
    }
    payload.validate()?;

    let key = RateLimitKey::new(
        payload.purpose,
        RateLimitActor {
            actor_type: payload.actor_type,
            value: payload.actor,
        },
    );
    state.rate_limiter.clear_limit(&key).await?;
    Ok(Json(json!({ "message": "Rate limit cleared" })))
}
