use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::error::AppError;
use crate::middleware::auth::verify_credential;
use crate::services::rate_limit::{RateLimitActor, RateLimitPurpose};
use crate::services::{RateLimitKey, RateLimitResult};
use crate::state::AppState;

pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const UNKNOWN_ACTOR: &str = "unknown";

/// Counts every request against its actor: the verified subject when the
/// request carries a valid credential, otherwise the client address.
pub async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let actor = resolve_actor(&state, &request);
    request.extensions_mut().insert(actor.clone());

    let key = RateLimitKey::new(RateLimitPurpose::Ordinary, actor);
    let result = state.rate_limiter.check_and_record(&key).await;

    let mut response = if result.allowed {
        next.run(request).await
    } else {
        rejection(&result).into_response()
    };
    apply_headers(response.headers_mut(), &result);
    response
}

/// Error for a denied attempt, distinguishing a real limit from an outage.
pub fn rejection(result: &RateLimitResult) -> AppError {
    if result.store_failure {
        AppError::ServiceUnavailable {
            code: "rate_limit_unavailable",
            message: "Service temporarily unavailable".to_string(),
        }
    } else {
        AppError::RateLimited {
            code: "rate_limit_exceeded",
            message: "Too many requests. Please try again later.".to_string(),
            retry_after: result.retry_after_secs(Utc::now()),
        }
    }
}

pub fn apply_headers(headers: &mut HeaderMap, result: &RateLimitResult) {
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(result.remaining),
    );
    headers.insert(
        RATE_LIMIT_RESET_HEADER,
        HeaderValue::from(result.reset_at.timestamp()),
    );
}

fn resolve_actor(state: &AppState, request: &Request) -> RateLimitActor {
    if let Some(claims) = verify_credential(state, request.headers()) {
        return RateLimitActor::subject(claims.sub);
    }
    RateLimitActor::ip(client_ip(request, state.config.trust_forwarded_for))
}

/// First `X-Forwarded-For` hop when the proxy is trusted, else the peer.
pub fn client_ip(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get(FORWARDED_FOR_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ACTOR.to_string())
}
