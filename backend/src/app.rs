use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers,
    middleware::{
        self as app_middleware,
        csrf::CSRF_HEADER,
        rate_limit::{RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER},
    },
    state::AppState,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assembles the full HTTP surface.
///
/// Every request is counted by the rate limiter. Protected routes then run
/// `auth` followed by `csrf_guard`.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/auth/login", post(handlers::auth::login));

    // route_layer wraps outside-in, so auth is added last to run first
    let protected_routes = Router::new()
        .route("/api/auth/refresh", post(handlers::auth::refresh))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/session", get(handlers::auth::current_session))
        .route("/api/users/online", get(handlers::presence::list_online))
        .route(
            "/api/users/{subject_id}/activity-state",
            get(handlers::presence::activity_state),
        )
        .route("/api/users/me/activity", post(handlers::presence::ping))
        .route("/api/presence/connect", post(handlers::presence::connect))
        .route(
            "/api/presence/disconnect",
            post(handlers::presence::disconnect),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            app_middleware::csrf_guard,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            app_middleware::auth,
        ));

    let admin_routes = Router::new().route(
        "/api/admin/rate-limits",
        delete(handlers::admin::clear_rate_limit),
    );

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            app_middleware::rate_limit,
        ))
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(app_middleware::request_id))
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(app_middleware::log_error_responses))
                .layer(cors_layer(&state.config.cors_allow_origins)),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER),
            HeaderName::from_static(RATE_LIMIT_RESET_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(24 * 60 * 60))
}
