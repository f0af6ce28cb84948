//! Admin endpoints for API key management.
//!
//! All routes require `Authorization: Bearer <ADMIN_API_TOKEN>`.
//! Raw keys are shown once, in the create response; every other response
//! carries a masked preview.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    db::ConnectionStats,
    error::AppError,
    extract::ValidatedJson,
    models::api_key::{ApiKeyResponse, CreateApiKeyRequest, MigrationReport, UpdateApiKeyRequest},
    services::api_key_service,
    state::AppState,
};

/// Issue a key for a subdomain.
///
/// # Response (201 Created)
///
/// ```json
/// {
///   "id": "550e8400-e29b-41d4-a716-446655440000",
///   "subdomain": "shipping",
///   "isActive": true,
///   "keyPreview": "molo_1a2b...9f0e",
///   "key": "molo_1a2b...full key..."
/// }
/// ```
pub async fn create_api_key(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let created = api_key_service::create_api_key(state.api_keys.as_ref(), request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// List every key, active or not, newest first.
///
/// # Response (200 OK)
///
/// ```json
/// [
///   {
///     "id": "550e8400-e29b-41d4-a716-446655440000",
///     "subdomain": "shipping",
///     "description": null,
///     "isActive": true,
///     "keyPreview": "sha256:3f1c9a2b...",
///     "legacy": false,
///     "createdAt": "2025-12-21T19:00:00Z",
///     "lastUsedAt": null
///   }
/// ]
/// ```
///
/// Raw keys are never included.
pub async fn list_api_keys(
    State(state): State<AppState>,
) -> Result<Json<Vec<ApiKeyResponse>>, AppError> {
    let keys = state.api_keys.list().await?;
    Ok(Json(keys.iter().map(ApiKeyResponse::from).collect()))
}

/// Fetch one key by id.
///
/// # Response
///
/// - **Success (200)**: the key, shaped as in [`list_api_keys`]
/// - **Error (404)**: No key with this id
pub async fn get_api_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiKeyResponse>, AppError> {
    let key = state
        .api_keys
        .get(id)
        .await?
        .ok_or(AppError::ApiKeyNotFound)?;
    Ok(Json(ApiKeyResponse::from(&key)))
}

/// Change the description or toggle `isActive` (soft disable).
pub async fn update_api_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ValidatedJson(changes): ValidatedJson<UpdateApiKeyRequest>,
) -> Result<Json<ApiKeyResponse>, AppError> {
    if changes.is_empty() {
        return Err(AppError::InvalidRequest(
            "Provide description and/or isActive".to_string(),
        ));
    }

    let key = state
        .api_keys
        .update(id, changes)
        .await?
        .ok_or(AppError::ApiKeyNotFound)?;
    tracing::info!(api_key_id = %key.id, is_active = key.is_active, "API key updated");
    Ok(Json(ApiKeyResponse::from(&key)))
}

/// Permanently delete a key.
///
/// Returns 204 No Content, or 404 when the key does not exist.
pub async fn delete_api_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if !state.api_keys.delete(id).await? {
        return Err(AppError::ApiKeyNotFound);
    }
    tracing::info!(api_key_id = %id, "API key deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Hash every remaining plaintext key.
///
/// Rows that already carry a hash only lose their plaintext. The rewrite is
/// a single batch, so a failure leaves every row as it was.
///
/// # Response (200 OK)
///
/// ```json
/// { "migrated": 3, "cleared": 1, "skipped": 0 }
/// ```
pub async fn migrate_api_keys(
    State(state): State<AppState>,
) -> Result<Json<MigrationReport>, AppError> {
    let report = api_key_service::migrate_legacy_keys(state.api_keys.as_ref()).await?;
    Ok(Json(report))
}

/// Current connection pool usage.
///
/// # Response (200 OK)
///
/// ```json
/// { "total": 4, "idle": 3, "active": 1, "waiting": 0, "max": 20 }
/// ```
pub async fn pool_stats(State(state): State<AppState>) -> Json<ConnectionStats> {
    Json(state.pool.connection_stats())
}
