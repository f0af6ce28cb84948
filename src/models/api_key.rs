//! API Key model for authentication.
//!
//! Each subdomain owns one key. Keys are stored as SHA-256 hashes; rows created
//! before hashing was introduced may still carry the raw key in `api_key`
//! until the migration routine rewrites them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::api_key_service::{StoredCredential, hash_preview, mask_api_key};

/// Represents a row of the `email_api_keys` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,

    /// Tenant the key belongs to (unique).
    pub subdomain: String,

    /// Legacy plaintext key. Deprecated; `None` once migrated.
    pub api_key: Option<String>,

    /// SHA-256 hex digest of the key. Wins over `api_key` when both are present.
    pub key_hash: Option<String>,

    pub description: Option<String>,

    /// Inactive keys are rejected during authentication without being deleted.
    pub is_active: bool,

    pub created_at: DateTime<Utc>,

    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// The credential used to verify callers, preferring the hash.
    pub fn credential(&self) -> Option<StoredCredential<'_>> {
        match (self.key_hash.as_deref(), self.api_key.as_deref()) {
            (Some(hash), _) => Some(StoredCredential::Hashed(hash)),
            (None, Some(plaintext)) => Some(StoredCredential::Legacy(plaintext)),
            (None, None) => None,
        }
    }

    /// True while the raw key is still stored.
    pub fn has_legacy_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// Values for a freshly issued key. Only the hash reaches storage.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub subdomain: String,
    pub key_hash: String,
    pub description: Option<String>,
}

/// Request body for `POST /admin/api-keys`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateApiKeyRequest {
    pub subdomain: String,
    pub description: Option<String>,
}

/// Request body for `PATCH /admin/api-keys/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateApiKeyRequest {
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

impl UpdateApiKeyRequest {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.is_active.is_none()
    }
}

/// API key as shown to administrators.
///
/// # Security Note
///
/// `key` is only populated in the response to the create call. Every other
/// response carries the masked `keyPreview` instead.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub subdomain: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub key_preview: String,
    /// Set while the row still stores a plaintext key.
    pub legacy: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl From<&ApiKeyRecord> for ApiKeyResponse {
    fn from(record: &ApiKeyRecord) -> Self {
        let key_preview = match record.credential() {
            Some(StoredCredential::Hashed(hash)) => hash_preview(hash),
            Some(StoredCredential::Legacy(plaintext)) => mask_api_key(plaintext),
            None => String::new(),
        };

        Self {
            id: record.id,
            subdomain: record.subdomain.clone(),
            description: record.description.clone(),
            is_active: record.is_active,
            key_preview,
            legacy: record.has_legacy_key(),
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            key: None,
        }
    }
}

impl ApiKeyResponse {
    /// Attach the raw key (creation response only).
    pub fn with_key(mut self, raw_key: String) -> Self {
        self.key_preview = mask_api_key(&raw_key);
        self.key = Some(raw_key);
        self
    }
}

/// Outcome of rewriting plaintext keys as hashes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Rows whose plaintext key was hashed.
    pub migrated: u64,
    /// Rows that already had a hash; only the plaintext was dropped.
    pub cleared: u64,
    /// Rows left untouched because the stored plaintext was unusable.
    pub skipped: u64,
}
