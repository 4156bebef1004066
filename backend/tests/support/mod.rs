#![allow(dead_code)]
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use riftgate_backend::{
    app::build_router,
    config::Config,
    services::{identity::DevIdentityProvider, IdentityProvider},
    state::AppState,
    store::MemoryStore,
};
use serde_json::Value;
use tower::ServiceExt;

pub const ADMIN_KEY: &str = "test-admin-key";

pub fn test_config() -> Config {
    Config {
        app_env: "test".to_string(),
        cookie_secure: false,
        admin_api_key: Some(ADMIN_KEY.to_string()),
        ..Config::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    memory: Option<Arc<MemoryStore>>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_identity(config, Arc::new(DevIdentityProvider))
    }

    pub fn with_identity(config: Config, identity: Arc<dyn IdentityProvider>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(config, store.clone(), identity);
        Self {
            router: build_router(state.clone()),
            state,
            memory: Some(store),
        }
    }

    /// App over an externally built state, e.g. one backed by Redis.
    pub fn from_state(state: AppState) -> Self {
        Self {
            router: build_router(state.clone()),
            state,
            memory: None,
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        self.memory.as_deref().expect("app is backed by a MemoryStore")
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn login(&self, code: &str) -> LoggedIn {
        let response = self
            .send(json_request(
                Method::POST,
                "/api/auth/login",
                serde_json::json!({ "code": code }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::OK, "login failed: {}", response.body);
        LoggedIn {
            access_token: response.body["access_token"]
                .as_str()
                .expect("access token")
                .to_string(),
            session_token: response.body["session_token"]
                .as_str()
                .expect("session token")
                .to_string(),
            csrf_token: response.body["csrf_token"]
                .as_str()
                .expect("csrf token")
                .to_string(),
            subject_id: response.body["subject_id"]
                .as_str()
                .expect("subject id")
                .to_string(),
        }
    }

    /// Authenticated request carrying the access token and, if given, a
    /// CSRF token.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        user: &LoggedIn,
        csrf: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", user.access_token));
        if let Some(token) = csrf {
            builder = builder.header("x-csrf-token", token);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");
        self.send(request).await
    }

    pub async fn advance(&self, secs: u64) {
        self.memory()
            .advance(std::time::Duration::from_secs(secs))
            .await;
    }
}

#[derive(Debug, Clone)]
pub struct LoggedIn {
    pub access_token: String,
    pub session_token: String,
    pub csrf_token: String,
    pub subject_id: String,
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn cookies(&self) -> Vec<&str> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }
}

pub fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}
