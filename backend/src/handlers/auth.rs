use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use crate::{
    error::AppError,
    middleware::{auth::AuthenticatedSession, csrf::attach_token},
    models::{Session, SessionSummary},
    state::AppState,
    store::non_negative,
    types::{SessionId, SubjectId},
    utils::{
        cookies::{build_clear_cookie, build_cookie, SESSION_COOKIE_NAME},
        jwt::{IssuedToken, TokenKind},
    },
};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    /// One-time code from the identity provider redirect.
    #[validate(length(min = 1, max = 512))]
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    pub platform_id: String,
    pub display_name: Option<String>,
    pub session_token: String,
    pub access_token: String,
    pub csrf_token: String,
    pub expires_at: DateTime<Utc>,
    pub access_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub session_token: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub access_token_expires_at: DateTime<Utc>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AppError> {
    payload.validate()?;

    let platform = state.identity.exchange(&payload.code).await?;
    let session_id = SessionId::new();
    let (session_token, access_token) = issue_tokens(&state, session_id, &platform.subject_id)?;

    let now = state.sessions.now().await?;
    let session = Session {
        session_id,
        subject_id: platform.subject_id.clone(),
        platform_id: platform.platform_id,
        platform_ticket: platform.ticket,
        session_token: session_token.token,
        access_token: access_token.token,
        display_name: platform.display_name,
        created: now,
        expires: now + state.sessions.expiration(),
        last_active: now,
        auth_source: platform.auth_source,
    };
    state.sessions.save(&session).await?;
    state.activity.record_activity(&session.subject_id).await?;
    let csrf_token = state.csrf.generate(session_id).await?;

    tracing::info!(
        %session_id,
        subject_id = %session.subject_id,
        auth_source = ?session.auth_source,
        "Session created"
    );

    let mut headers = HeaderMap::new();
    set_session_cookie(&mut headers, &state, &session, now);
    attach_token(&mut headers, &csrf_token, &state.config);

    let body = LoginResponse {
        session_id,
        subject_id: session.subject_id,
        platform_id: session.platform_id,
        display_name: session.display_name,
        session_token: session.session_token,
        access_token: session.access_token,
        csrf_token,
        expires_at: session.expires,
        access_token_expires_at: access_token.expires_at,
    };
    Ok((headers, Json(body)).into_response())
}

/// Reissues session and access tokens after confirming the platform still
/// honors the login. The CSRF guard has already rotated the CSRF token.
pub async fn refresh(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
) -> Result<Response, AppError> {
    let session_id = auth.session_id;
    let mut session = state
        .sessions
        .get(session_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("session_invalid", "Session not found"))?;

    if !state.identity.validate_ticket(&session.platform_ticket).await? {
        state.sessions.remove(session_id).await?;
        state.csrf.invalidate(session_id).await?;
        tracing::warn!(%session_id, subject_id = %session.subject_id, "Platform ticket rejected, session removed");
        return Err(AppError::unauthorized(
            "platform_session_expired",
            "Platform session expired",
        ));
    }

    let (session_token, access_token) = issue_tokens(&state, session_id, &session.subject_id)?;
    let now = state.sessions.now().await?;
    session.session_token = session_token.token;
    session.access_token = access_token.token;
    session.last_active = now;
    state.sessions.save(&session).await?;

    tracing::info!(%session_id, "Session refreshed");

    let mut headers = HeaderMap::new();
    set_session_cookie(&mut headers, &state, &session, now);
    let body = RefreshResponse {
        session_token: session.session_token,
        access_token: session.access_token,
        expires_at: session.expires,
        access_token_expires_at: access_token.expires_at,
    };
    Ok((headers, Json(body)).into_response())
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
) -> Result<Response, AppError> {
    state.sessions.remove(auth.session_id).await?;
    state.csrf.invalidate(auth.session_id).await?;
    tracing::info!(session_id = %auth.session_id, "Session ended");

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&build_clear_cookie(
        SESSION_COOKIE_NAME,
        state.config.cookie_options(),
    )) {
        headers.append(header::SET_COOKIE, value);
    }
    Ok((headers, Json(json!({ "message": "Logged out successfully" }))).into_response())
}

pub async fn current_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedSession>,
) -> Result<Json<SessionSummary>, AppError> {
    let session = state
        .sessions
        .get(auth.session_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("session_invalid", "Session not found"))?;
    Ok(Json(session.summary(auth.liveness)))
}

fn issue_tokens(
    state: &AppState,
    session_id: SessionId,
    subject_id: &SubjectId,
) -> Result<(IssuedToken, IssuedToken), AppError> {
    let session_token = state
        .tokens
        .issue(TokenKind::Session, session_id, subject_id)
        .map_err(|e| AppError::InternalServerError(e.into()))?;
    let access_token = state
        .tokens
        .issue(TokenKind::Access, session_id, subject_id)
        .map_err(|e| AppError::InternalServerError(e.into()))?;
    Ok((session_token, access_token))
}

fn set_session_cookie(headers: &mut HeaderMap, state: &AppState, session: &Session, now: DateTime<Utc>) {
    let max_age = non_negative(session.expires - now)
        .min(non_negative(state.tokens.ttl(TokenKind::Session)));
    let cookie = build_cookie(
        SESSION_COOKIE_NAME,
        &session.session_token,
        max_age,
        state.config.cookie_options(),
    );
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.append(header::SET_COOKIE, value);
    }
}
