use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use riftgate_backend::services::{
    identity::DevIdentityProvider, IdentityError, IdentityProvider, PlatformLogin,
};
use serde_json::json;

mod support;

use support::{json_request, test_config, TestApp};

#[tokio::test]
async fn login_issues_tokens_and_cookies() {
    let app = TestApp::new();
    let response = app
        .send(json_request(
            Method::POST,
            "/api/auth/login",
            json!({ "code": "player-one" }),
        ))
        .await;

    assert_eq!(response.status, StatusCode::OK);
    let csrf = response.body["csrf_token"].as_str().unwrap();
    assert_eq!(csrf.len(), 43);
    assert_eq!(response.header("x-csrf-token"), Some(csrf));
    assert!(response.body["subject_id"].as_str().unwrap().starts_with("dev-"));

    let cookies = response.cookies();
    assert!(cookies.iter().any(|c| c.starts_with("session_token=") && c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.starts_with(&format!("csrf_token={}", csrf))));
}

#[tokio::test]
async fn login_rejects_empty_code() {
    let app = TestApp::new();
    let response = app
        .send(json_request(Method::POST, "/api/auth/login", json!({ "code": "" })))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["code"], "validation_error");
}

#[tokio::test]
async fn session_cookie_authenticates_requests() {
    let app = TestApp::new();
    let user = app.login("cookie-user").await;

    let request = axum::http::Request::builder()
        .uri("/api/auth/session")
        .header("cookie", format!("session_token={}", user.session_token))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["subject_id"], user.subject_id);
    assert_eq!(response.body["liveness"], "active");
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let app = TestApp::new();
    let request = axum::http::Request::builder()
        .uri("/api/auth/session")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["code"], "unauthorized");
}

#[tokio::test]
async fn refresh_rotates_csrf_token_with_grace_period() {
    let app = TestApp::new();
    let user = app.login("rotator").await;
    let t0 = user.csrf_token.clone();

    let refreshed = app
        .call(Method::POST, "/api/auth/refresh", &user, Some(&t0), None)
        .await;
    assert_eq!(refreshed.status, StatusCode::OK);
    let t1 = refreshed.header("x-csrf-token").unwrap().to_string();
    assert_ne!(t0, t1);
    assert!(refreshed
        .cookies()
        .iter()
        .any(|c| c.starts_with(&format!("csrf_token={}", t1))));

    app.advance(29).await;
    let within_grace = app
        .call(Method::POST, "/api/users/me/activity", &user, Some(&t0), None)
        .await;
    assert_eq!(within_grace.status, StatusCode::OK);

    app.advance(2).await;
    let after_grace = app
        .call(Method::POST, "/api/users/me/activity", &user, Some(&t0), None)
        .await;
    assert_eq!(after_grace.status, StatusCode::FORBIDDEN);
    assert_eq!(after_grace.body["code"], "csrf_token_invalid");
    assert_eq!(after_grace.body["message"], "Invalid CSRF token");

    let current = app
        .call(Method::POST, "/api/users/me/activity", &user, Some(&t1), None)
        .await;
    assert_eq!(current.status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_converge_on_one_token() {
    let app = Arc::new(TestApp::new());
    let user = app.login("racer").await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let app = app.clone();
        let user = user.clone();
        handles.push(tokio::spawn(async move {
            app.call(
                Method::POST,
                "/api/auth/refresh",
                &user,
                Some(&user.csrf_token),
                None,
            )
            .await
        }));
    }

    let mut tokens = HashSet::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, StatusCode::OK, "{}", response.body);
        tokens.insert(response.header("x-csrf-token").unwrap().to_string());
    }
    assert_eq!(tokens.len(), 1);
    assert!(!tokens.contains(&user.csrf_token));
}

#[tokio::test]
async fn refresh_with_stale_token_reissues() {
    let app = TestApp::new();
    let user = app.login("stale").await;

    let response = app
        .call(Method::POST, "/api/auth/refresh", &user, Some("not-a-real-token"), None)
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let reissued = response.header("x-csrf-token").unwrap();
    assert_ne!(reissued, user.csrf_token);
}

#[tokio::test]
async fn unsafe_requests_require_csrf_token() {
    let app = TestApp::new();
    let user = app.login("forgetful").await;

    let response = app
        .call(Method::POST, "/api/users/me/activity", &user, None, None)
        .await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.body["code"], "csrf_token_missing");

    let safe = app
        .call(Method::GET, "/api/auth/session", &user, None, None)
        .await;
    assert_eq!(safe.status, StatusCode::OK);
}

#[tokio::test]
async fn repeated_csrf_failures_block_the_subject() {
    let app = TestApp::new();
    let user = app.login("attacker").await;

    for _ in 0..3 {
        let response = app
            .call(Method::POST, "/api/users/me/activity", &user, Some("forged"), None)
            .await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    let blocked = app
        .call(
            Method::POST,
            "/api/users/me/activity",
            &user,
            Some(&user.csrf_token),
            None,
        )
        .await;
    assert_eq!(blocked.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(blocked.body["code"], "rate_limit_exceeded");
    assert!(blocked.header("retry-after").is_some());
}

#[tokio::test]
async fn logout_ends_the_session() {
    let app = TestApp::new();
    let user = app.login("leaver").await;

    let response = app
        .call(
            Method::POST,
            "/api/auth/logout",
            &user,
            Some(&user.csrf_token),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["message"], "Logged out successfully");
    let cookies = response.cookies();
    assert!(cookies.iter().any(|c| c.starts_with("session_token=;")));
    assert!(cookies.iter().any(|c| c.starts_with("csrf_token=;")));

    let after = app
        .call(Method::GET, "/api/auth/session", &user, None, None)
        .await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
    assert_eq!(after.body["code"], "session_invalid");
}

#[tokio::test]
async fn offline_subjects_must_log_in_again() {
    let app = TestApp::new();
    let user = app.login("sleeper").await;

    app.advance(16 * 60).await;
    let response = app
        .call(Method::GET, "/api/auth/session", &user, None, None)
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["code"], "session_expired");
}

struct RevocableIdentity {
    inner: DevIdentityProvider,
    revoked: AtomicBool,
}

#[async_trait]
impl IdentityProvider for RevocableIdentity {
    async fn exchange(&self, code: &str) -> Result<PlatformLogin, IdentityError> {
        self.inner.exchange(code).await
    }

    async fn validate_ticket(&self, ticket: &str) -> Result<bool, IdentityError> {
        if self.revoked.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.validate_ticket(ticket).await
    }
}

#[tokio::test]
async fn refresh_fails_when_platform_revokes_ticket() {
    let identity = Arc::new(RevocableIdentity {
        inner: DevIdentityProvider,
        revoked: AtomicBool::new(false),
    });
    let app = TestApp::with_identity(test_config(), identity.clone());
    let user = app.login("banned").await;

    identity.revoked.store(true, Ordering::SeqCst);
    let response = app
        .call(
            Method::POST,
            "/api/auth/refresh",
            &user,
            Some(&user.csrf_token),
            None,
        )
        .await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.body["code"], "platform_session_expired");
    assert!(response.header("x-csrf-token").is_none());

    let after = app
        .call(Method::GET, "/api/auth/session", &user, None, None)
        .await;
    assert_eq!(after.status, StatusCode::UNAUTHORIZED);
}
