use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.store.now().await {
        Ok(now) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": "up", "time": now })),
        ),
        Err(err) => {
            tracing::error!(error = %err, "Health check could not reach store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "store": "down" })),
            )
        }
    }
}
