use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Duration;

use crate::{
    error::AppError,
    models::LivenessState,
    state::AppState,
    types::{SessionId, SubjectId},
    utils::{
        cookies::{cookie_value, SESSION_COOKIE_NAME},
        jwt::{Claims, TokenKind},
    },
};

/// `last_active` is only persisted when it is older than this.
const TOUCH_INTERVAL_SECS: i64 = 60;

/// Credential found on a request, before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub kind: TokenKind,
}

/// Identity resolved by [`auth`], available to handlers and later guards.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub session_id: SessionId,
    pub subject_id: SubjectId,
    pub liveness: LivenessState,
    pub credential_kind: TokenKind,
}

/// A bearer header carries an access token; otherwise the session cookie
/// carries the session token.
pub fn extract_credential(headers: &HeaderMap) -> Option<Credential> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some(Credential {
            token: token.to_string(),
            kind: TokenKind::Access,
        });
    }

    cookie_value(headers, SESSION_COOKIE_NAME).map(|token| Credential {
        token,
        kind: TokenKind::Session,
    })
}

/// Signature-only check, no store access.
pub fn verify_credential(state: &AppState, headers: &HeaderMap) -> Option<Claims> {
    let credential = extract_credential(headers)?;
    state.tokens.verify(&credential.token, credential.kind).ok()
}

pub async fn auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let session = authenticate_request(&state, request.headers()).await?;
    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthenticatedSession, AppError> {
    let credential = extract_credential(headers)
        .ok_or_else(|| AppError::unauthorized("unauthorized", "Authentication required"))?;

    let claims = state.tokens.verify(&credential.token, credential.kind)?;
    let session_id = claims.session_id()?;
    let subject_id = claims.subject_id();

    let session = state
        .sessions
        .get(session_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("session_invalid", "Session not found"))?;
    if session.subject_id != subject_id {
        tracing::warn!(%session_id, "Credential subject does not match session");
        return Err(AppError::unauthorized("session_invalid", "Invalid session token"));
    }

    let liveness = state.activity.liveness(&subject_id).await?;
    if liveness.is_offline() {
        tracing::debug!(%session_id, %subject_id, "Rejecting request from offline subject");
        return Err(AppError::unauthorized("session_expired", "Session expired"));
    }

    if let Err(err) = state.activity.record_activity(&subject_id).await {
        tracing::warn!(%subject_id, error = %err, "Failed to record activity");
    }
    let now = state.sessions.now().await?;
    if now - session.last_active >= Duration::seconds(TOUCH_INTERVAL_SECS) {
        if let Err(err) = state.sessions.touch(session_id).await {
            tracing::warn!(%session_id, error = %err, "Failed to touch session");
        }
    }

    Ok(AuthenticatedSession {
        session_id,
        subject_id,
        liveness,
        credential_kind: credential.kind,
    })
}

fn parse_bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bearer_token_ignores_scheme_case() {
        assert_eq!(parse_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(parse_bearer_token("BEARER abc"), Some("abc"));
        assert_eq!(parse_bearer_token("Basic abc"), None);
        assert_eq!(parse_bearer_token("Bearer"), None);
    }

    #[test]
    fn bearer_header_wins_over_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer access".parse().unwrap());
        headers.insert(header::COOKIE, "session_token=session".parse().unwrap());
        assert_eq!(
            extract_credential(&headers),
            Some(Credential {
                token: "access".into(),
                kind: TokenKind::Access
            })
        );
    }

    #[test]
    fn session_cookie_is_the_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "a=1; session_token=session".parse().unwrap());
        assert_eq!(
            extract_credential(&headers),
            Some(Credential {
                token: "session".into(),
                kind: TokenKind::Session
            })
        );
        assert_eq!(extract_credential(&HeaderMap::new()), None);
    }
}
