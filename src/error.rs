//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and JSON bodies.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{db::PoolError, services::transport::TransportError, store::StoreError};

/// Application-wide error type.
///
/// # Error Categories
///
/// - **Authentication**: missing, invalid or inactive API key (never says which)
/// - **Rate limiting**: quota exhausted, carries the seconds until the window resets
/// - **Validation**: malformed body or caller-supplied form type
/// - **Dependency**: database or email relay failures, detail logged server-side only
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// API key is missing, invalid, or inactive.
    ///
    /// Returns HTTP 401 Unauthorized.
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    /// Admin bearer token missing or wrong.
    #[error("Unauthorized")]
    Unauthorized,

    /// Returns HTTP 429 with a `Retry-After` header.
    #[error("Too many requests, retry in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    /// A single field failed validation.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("{field} {message}")]
    Validation { field: &'static str, message: String },

    /// Request body or parameters are invalid.
    ///
    /// Returns HTTP 400 Bad Request.
    #[error("Invalid request")]
    InvalidRequest(String),

    #[error("Unknown form type: {0}")]
    UnknownFormType(String),

    #[error("No active template for form type: {0}")]
    TemplateNotFound(String),

    #[error("API key not found")]
    ApiKeyNotFound,

    /// Returns HTTP 409 Conflict.
    #[error("{0}")]
    Conflict(String),

    /// The server is missing configuration needed to complete the request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Pool(#[from] PoolError),

    #[error("Email transport error: {0}")]
    Transport(#[from] TransportError),
}

impl AppError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        AppError::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Pool(pool_err) => AppError::Pool(pool_err),
            StoreError::Duplicate(message) => AppError::Conflict(message),
        }
    }
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// All errors return JSON in this format:
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// Rate-limited responses add a top-level `retryAfter` and validation errors
/// add `error.field`.
///
/// # Status Code Mapping
///
/// - `InvalidApiKey`, `Unauthorized` → 401 Unauthorized
/// - `RateLimited` → 429 Too Many Requests
/// - `Validation`, `InvalidRequest`, `UnknownFormType`, `TemplateNotFound` → 400 Bad Request
/// - `ApiKeyNotFound` → 404 Not Found
/// - `Conflict` → 409 Conflict
/// - `Pool`, `Transport`, `Configuration` → 500 Internal Server Error (hides details from client)
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                self.to_string(),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", self.to_string()),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                self.to_string(),
            ),
            AppError::Validation { .. } => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::UnknownFormType(_) => (
                StatusCode::BAD_REQUEST,
                "unknown_form_type",
                self.to_string(),
            ),
            AppError::TemplateNotFound(_) => (
                StatusCode::BAD_REQUEST,
                "template_not_found",
                self.to_string(),
            ),
            AppError::ApiKeyNotFound => {
                (StatusCode::NOT_FOUND, "api_key_not_found", self.to_string())
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone()),
            AppError::Pool(_) | AppError::Transport(_) | AppError::Configuration(_) => {
                tracing::error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": code,
            "message": message,
        });
        if let AppError::Validation { field, .. } = &self {
            error["field"] = json!(field);
        }

        let mut body = json!({ "error": error });
        if let AppError::RateLimited { retry_after_secs } = &self {
            body["retryAfter"] = json!(retry_after_secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let AppError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_sets_header_and_body() {
        let response = AppError::RateLimited {
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "42");
        let body = body_json(response).await;
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(body["error"]["code"], "rate_limited");
    }

    #[tokio::test]
    async fn dependency_failures_hide_details() {
        let response = AppError::Pool(PoolError::AcquireTimeout).into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn validation_errors_carry_the_field() {
        let response = AppError::validation("email", "must be a valid email address").into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["field"], "email");
    }

    #[test]
    fn unknown_form_type_is_a_client_error() {
        let response = AppError::UnknownFormType("nope".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = AppError::TemplateNotFound("contact".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
