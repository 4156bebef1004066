use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::services::{CsrfError, IdentityError};
use crate::store::StoreError;
use crate::utils::jwt::TokenError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Unauthorized {
        code: &'static str,
        message: String,
    },
    Forbidden {
        code: &'static str,
        message: String,
    },
    RateLimited {
        code: &'static str,
        message: String,
        retry_after: u64,
    },
    ServiceUnavailable {
        code: &'static str,
        message: String,
    },
    Store(StoreError),
    InternalServerError(anyhow::Error),
    Validation(Vec<String>),
}

impl AppError {
    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        AppError::Forbidden {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceUnavailable { .. } | AppError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut retry_after = None;
        let (message, code, details) = match self {
            AppError::NotFound(msg) => (msg, "not_found", None),
            AppError::BadRequest(msg) => (msg, "bad_request", None),
            AppError::Unauthorized { code, message } | AppError::Forbidden { code, message } => {
                (message, code, None)
            }
            AppError::RateLimited {
                code,
                message,
                retry_after: secs,
            } => {
                retry_after = Some(secs);
                (message, code, None)
            }
            AppError::ServiceUnavailable { code, message } => (message, code, None),
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store failure while handling request");
                (
                    "Service temporarily unavailable".to_string(),
                    "store_unavailable",
                    None,
                )
            }
            AppError::InternalServerError(err) => {
                tracing::error!("Internal server error: {:?}", err);
                ("Internal server error".to_string(), "internal_error", None)
            }
            AppError::Validation(errors) => (
                "Validation failed".to_string(),
                "validation_error",
                Some(serde_json::json!({ "errors": errors })),
            ),
        };

        let body = Json(ErrorResponse {
            message,
            code: code.to_string(),
            details,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        tracing::debug!(error = %err, "Credential rejected");
        AppError::unauthorized("session_invalid", "Invalid session token")
    }
}

impl From<CsrfError> for AppError {
    fn from(err: CsrfError) -> Self {
        match err {
            CsrfError::SessionNotFound => {
                AppError::unauthorized("session_invalid", "Session not found")
            }
            CsrfError::InvalidToken => AppError::forbidden("csrf_token_invalid", "Invalid CSRF token"),
            CsrfError::StoreUnavailable(err) => AppError::Store(err),
        }
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Rejected => AppError::unauthorized("login_failed", "Login failed"),
            IdentityError::Unavailable(reason) => {
                tracing::error!(reason = %reason, "Identity provider unavailable");
                AppError::ServiceUnavailable {
                    code: "identity_unavailable",
                    message: "Login is temporarily unavailable".to_string(),
                }
            }
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        AppError::Validation(messages)
    }
}
