use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header::CONTENT_LENGTH, Request},
    middleware::Next,
    response::Response,
    Error as AxumError,
};
use std::time::Instant;

use crate::middleware::request_id::RequestId;

const MAX_BUFFERED_BODY_BYTES: usize = 64 * 1024;

/// Logs every 4xx/5xx response with its machine-readable `code`. Client
/// errors are warnings, server errors are errors. The body is buffered and
/// forwarded unchanged.
pub async fn log_error_responses(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(req).await;
    let status = response.status();

    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let event = ErrorEvent {
        status: status.as_u16(),
        method: &method,
        path: &path,
        request_id: &request_id,
        latency_ms: start.elapsed().as_millis() as u64,
    };
    let (mut parts, body) = response.into_parts();
    match to_bytes(body, MAX_BUFFERED_BODY_BYTES).await {
        Ok(bytes) => {
            event.log(error_code(&bytes).as_deref(), None);
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => {
            parts.headers.remove(CONTENT_LENGTH);
            event.log(None, Some(err));
            Response::from_parts(parts, Body::empty())
        }
    }
}

fn error_code(bytes: &Bytes) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    json.get("code")?.as_str().map(str::to_string)
}

struct ErrorEvent<'a> {
    status: u16,
    method: &'a str,
    path: &'a str,
    request_id: &'a str,
    latency_ms: u64,
}

impl ErrorEvent<'_> {
    fn log(&self, code: Option<&str>, body_error: Option<AxumError>) {
        let code = code.unwrap_or("-");
        let body_error = body_error.map(|e| e.to_string());
        if self.status >= 500 {
            tracing::error!(
                status = self.status,
                method = self.method,
                path = self.path,
                request_id = self.request_id,
                latency_ms = self.latency_ms,
                code,
                body_error,
                "Request completed with error status"
            );
        } else {
            tracing::warn!(
                status = self.status,
                method = self.method,
                path = self.path,
                request_id = self.request_id,
                latency_ms = self.latency_ms,
                code,
                body_error,
                "Request completed with error status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, middleware, routing::get, Router};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[test]
    fn error_code_reads_json_bodies_only() {
        assert_eq!(
            error_code(&Bytes::from_static(br#"{"message":"x","code":"csrf_token_invalid"}"#))
                .as_deref(),
            Some("csrf_token_invalid")
        );
        assert_eq!(error_code(&Bytes::from_static(b"plain text")), None);
    }

    #[tokio::test]
    async fn error_bodies_pass_through_unchanged() {
        let app = Router::new()
            .route(
                "/fail",
                get(|| async { (StatusCode::FORBIDDEN, r#"{"code":"nope"}"#) }),
            )
            .layer(middleware::from_fn(log_error_responses));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/fail")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"code":"nope"}"#);
    }
}
