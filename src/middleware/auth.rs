//! API key authentication middleware.
//!
//! This middleware intercepts every protected email request to:
//! 1. Extract the API key from the `x-api-key` header
//! 2. Verify it against the active key records (hash first, legacy plaintext second)
//! 3. Inject authentication context into the request
//! 4. Reject unauthorized requests with HTTP 401
//!
//! The admin routes use a separate bearer-token check.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{error::AppError, services::api_key_service, state::AppState};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SUBDOMAIN_HEADER: &str = "x-subdomain";

/// Authentication context attached to authenticated requests.
///
/// Inserted into the request's extension map; handlers extract it with
/// `Extension<AuthContext>`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// ID of the authenticated API key
    pub api_key_id: Uuid,

    /// Subdomain the request acts for. `x-subdomain` overrides the key's own.
    pub subdomain: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// API key authentication middleware function.
///
/// # Flow
///
/// 1. Read `x-api-key` (missing ⇒ 401)
/// 2. Find the first active record whose credential matches
/// 3. Resolve the subdomain (`x-subdomain` header, else the key's); a
///    malformed header is a 400
/// 4. Touch `last_used_at` in the background
/// 5. Inject `AuthContext` and call the next handler
///
/// Every authentication failure yields the same 401 body.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let api_key = header_value(request.headers(), API_KEY_HEADER).ok_or(AppError::InvalidApiKey)?;

    let record = api_key_service::authenticate(state.api_keys.as_ref(), &api_key).await?;

    let subdomain = match header_value(request.headers(), SUBDOMAIN_HEADER) {
        Some(raw_override) => {
            let override_subdomain = api_key_service::normalize_subdomain(&raw_override)?;
            if override_subdomain != record.subdomain {
                tracing::debug!(
                    api_key_id = %record.id,
                    key_subdomain = %record.subdomain,
                    subdomain = %override_subdomain,
                    "x-subdomain overrides key subdomain"
                );
            }
            override_subdomain
        }
        None => record.subdomain.clone(),
    };

    api_key_service::record_usage(Arc::clone(&state.api_keys), record.id);

    request.extensions_mut().insert(AuthContext {
        api_key_id: record.id,
        subdomain,
    });

    Ok(next.run(request).await)
}

/// Admin bearer-token middleware.
///
/// Expects `Authorization: Bearer <ADMIN_API_TOKEN>`. With no token
/// configured, every admin request is rejected.
pub async fn admin_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .settings
        .admin_token
        .as_deref()
        .ok_or(AppError::Unauthorized)?;

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!(path = %request.uri().path(), "rejected admin request with wrong token");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
