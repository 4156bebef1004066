use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::Response,
};

use crate::config::Config;
use crate::error::AppError;
use crate::middleware::auth::AuthenticatedSession;
use crate::middleware::rate_limit::rejection;
use crate::services::rate_limit::{RateLimitActor, RateLimitPurpose};
use crate::services::RateLimitKey;
use crate::state::AppState;
use crate::utils::cookies::{build_clear_cookie, build_script_cookie, CSRF_COOKIE_NAME};
use crate::utils::security::fingerprint;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
const EXEMPT_PATHS: &[&str] = &["/api/auth/login", "/api/health"];

fn is_exempt(method: &Method, path: &str) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
        || EXEMPT_PATHS.contains(&path)
}

fn presented_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Runs after [`crate::middleware::auth::auth`]. Refresh mints a rotated
/// token, logout validates then invalidates, every other unsafe request must
/// present a valid token in `X-CSRF-Token`.
pub async fn csrf_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if is_exempt(request.method(), request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let session = request
        .extensions()
        .get::<AuthenticatedSession>()
        .cloned()
        .ok_or_else(|| {
            AppError::forbidden("session_invalid", "Invalid session for CSRF validation")
        })?;
    let actor = request
        .extensions()
        .get::<RateLimitActor>()
        .cloned()
        .unwrap_or_else(|| RateLimitActor::subject(session.subject_id.to_string()));
    let limit_key = RateLimitKey::new(RateLimitPurpose::Csrf, actor);
    if let Some(blocked) = state.rate_limiter.check_blocked(&limit_key).await {
        return Err(rejection(&blocked));
    }

    let presented = presented_token(request.headers());
    let path = request.uri().path().to_string();

    if path == REFRESH_PATH {
        let token = state
            .csrf
            .refresh(session.session_id, presented.as_deref())
            .await?;
        let mut response = next.run(request).await;
        if response.status().is_success() || session_survived(&state, &session).await {
            attach_token(response.headers_mut(), &token, &state.config);
        }
        return Ok(response);
    }

    let Some(token) = presented else {
        record_failure(&state, &limit_key, &session, None).await;
        return Err(AppError::forbidden("csrf_token_missing", "CSRF token required"));
    };
    if !state.csrf.validate(session.session_id, &token).await? {
        record_failure(&state, &limit_key, &session, Some(&token)).await;
        return Err(AppError::forbidden("csrf_token_invalid", "Invalid CSRF token"));
    }

    if path == LOGOUT_PATH {
        state.csrf.invalidate(session.session_id).await?;
        let mut response = next.run(request).await;
        if let Ok(value) =
            HeaderValue::from_str(&build_clear_cookie(CSRF_COOKIE_NAME, state.config.cookie_options()))
        {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        return Ok(response);
    }

    Ok(next.run(request).await)
}

/// The rotation already happened, so a failed refresh still hands out the
/// new token unless the handler ended the session.
async fn session_survived(state: &AppState, session: &AuthenticatedSession) -> bool {
    match state.sessions.get(session.session_id).await {
        Ok(found) => found.is_some(),
        Err(err) => {
            tracing::warn!(session_id = %session.session_id, error = %err, "Could not recheck session after refresh");
            true
        }
    }
}

async fn record_failure(
    state: &AppState,
    limit_key: &RateLimitKey,
    session: &AuthenticatedSession,
    token: Option<&str>,
) {
    let result = state.rate_limiter.check_and_record(limit_key).await;
    tracing::warn!(
        session_id = %session.session_id,
        subject_id = %session.subject_id,
        token = %token.map(fingerprint).unwrap_or_else(|| "-".to_string()),
        remaining = result.remaining,
        blocked = !result.allowed,
        "CSRF validation failed"
    );
}

/// Hands a CSRF token to the client as a response header and cookie.
pub fn attach_token(headers: &mut HeaderMap, token: &str, config: &Config) {
    if let Ok(value) = HeaderValue::from_str(token) {
        headers.insert(CSRF_HEADER, value);
    }
    let max_age = Duration::from_secs(
        (config.csrf_max_ttl_days * 24 * 60 * 60)
            .min(config.session_expiration_days as u64 * 24 * 60 * 60),
    );
    let cookie = build_script_cookie(CSRF_COOKIE_NAME, token, max_age, config.cookie_options());
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.append(header::SET_COOKIE, value);
    }
}
