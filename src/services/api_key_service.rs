//! API key hashing, verification and lifecycle.
//!
//! Keys are high-entropy random tokens, so they are hashed with plain SHA-256
//! (no salt): the digest must be identical across restarts and instances so a
//! stored hash can be compared on any server. Comparisons run in constant time.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::api_key::{
        ApiKeyRecord, ApiKeyResponse, CreateApiKeyRequest, MigrationReport, NewApiKey,
    },
    store::ApiKeyStore,
};

/// Prefix of every generated key.
pub const API_KEY_PREFIX: &str = "molo_";

const MAX_RAW_KEY_LEN: usize = 256;
const MAX_SUBDOMAIN_LEN: usize = 253;
const SHA256_HEX_LEN: usize = 64;

/// How an API key is stored for a record.
///
/// `Legacy` exists only until every row has been migrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredCredential<'a> {
    Hashed(&'a str),
    Legacy(&'a str),
}

impl StoredCredential<'_> {
    /// Constant-time check of `raw_key` against this credential.
    pub fn matches(&self, raw_key: &str) -> bool {
        match self {
            StoredCredential::Hashed(hash) => verify_api_key(raw_key, hash),
            StoredCredential::Legacy(plaintext) => {
                is_well_formed(raw_key) && bool::from(raw_key.as_bytes().ct_eq(plaintext.as_bytes()))
            }
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredCredential::Legacy(_))
    }
}

/// SHA-256 of the raw key, lowercase hex.
pub fn hash_api_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the hash of `raw_key` and compare it to `stored_hash` in constant time.
///
/// Empty or malformed keys never verify.
pub fn verify_api_key(raw_key: &str, stored_hash: &str) -> bool {
    if !is_well_formed(raw_key) || stored_hash.len() != SHA256_HEX_LEN {
        return false;
    }
    let computed = hash_api_key(raw_key);
    computed
        .as_bytes()
        .ct_eq(stored_hash.to_ascii_lowercase().as_bytes())
        .into()
}

/// Non-empty, bounded, printable ASCII without whitespace.
pub fn is_well_formed(raw_key: &str) -> bool {
    !raw_key.is_empty()
        && raw_key.len() <= MAX_RAW_KEY_LEN
        && raw_key.bytes().all(|b| b.is_ascii_graphic())
}

/// Generate a new key: `molo_` followed by 32 random bytes as hex.
pub fn generate_api_key() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("{API_KEY_PREFIX}{}", hex::encode(bytes))
}

/// Masked preview of a raw key, e.g. `molo_1a2b...9f0e`.
pub fn mask_api_key(raw_key: &str) -> String {
    let (prefix, rest) = match raw_key.strip_prefix(API_KEY_PREFIX) {
        Some(rest) => (API_KEY_PREFIX, rest),
        None => ("", raw_key),
    };
    if !rest.is_ascii() || rest.len() < 12 {
        return format!("{prefix}****");
    }
    format!("{prefix}{}...{}", &rest[..4], &rest[rest.len() - 4..])
}

/// Preview for rows where only the hash is known.
pub fn hash_preview(hash: &str) -> String {
    let head: String = hash.chars().take(8).collect();
    format!("sha256:{head}...")
}

/// First active record whose credential accepts `raw_key`, in storage order.
pub fn find_matching_key<'a>(records: &'a [ApiKeyRecord], raw_key: &str) -> Option<&'a ApiKeyRecord> {
    records.iter().filter(|record| record.is_active).find(|record| {
        let Some(credential) = record.credential() else {
            return false;
        };
        let matched = credential.matches(raw_key);
        if matched && credential.is_legacy() {
            tracing::warn!(
                api_key_id = %record.id,
                subdomain = %record.subdomain,
                "authenticated with a plaintext API key; run the key migration"
            );
        }
        matched
    })
}

/// Validate a caller's key against the active records.
///
/// Storage failures are logged and reported as an invalid key so the caller
/// cannot tell a lookup failure from a bad key.
pub async fn authenticate(store: &dyn ApiKeyStore, raw_key: &str) -> Result<ApiKeyRecord, AppError> {
    if !is_well_formed(raw_key) {
        return Err(AppError::InvalidApiKey);
    }

    let records = match store.active_keys().await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(error = %e, "API key lookup failed");
            return Err(AppError::InvalidApiKey);
        }
    };

    find_matching_key(&records, raw_key)
        .cloned()
        .ok_or(AppError::InvalidApiKey)
}

/// Update `last_used_at` in the background. Errors are only logged.
pub fn record_usage(store: Arc<dyn ApiKeyStore>, api_key_id: Uuid) {
    tokio::spawn(async move {
        if let Err(e) = store.touch_last_used(api_key_id).await {
            tracing::warn!(api_key_id = %api_key_id, error = %e, "failed to update API key last_used_at");
        }
    });
}

/// Issue a key for a subdomain. The raw key appears only in the returned response.
pub async fn create_api_key(
    store: &dyn ApiKeyStore,
    request: CreateApiKeyRequest,
) -> Result<ApiKeyResponse, AppError> {
    let subdomain = normalize_subdomain(&request.subdomain)?;
    let description = request
        .description
        .map(|d| d.trim().to_owned())
        .filter(|d| !d.is_empty());

    let raw_key = generate_api_key();
    let record = store
        .insert(NewApiKey {
            subdomain,
            key_hash: hash_api_key(&raw_key),
            description,
        })
        .await?;

    tracing::info!(api_key_id = %record.id, subdomain = %record.subdomain, "API key created");
    Ok(ApiKeyResponse::from(&record).with_key(raw_key))
}

/// Lowercase and check a subdomain label list (`[a-z0-9-]` separated by dots).
pub fn normalize_subdomain(subdomain: &str) -> Result<String, AppError> {
    let normalized = subdomain.trim().to_ascii_lowercase();
    let valid = !normalized.is_empty()
        && normalized.len() <= MAX_SUBDOMAIN_LEN
        && normalized.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        });

    if valid {
        Ok(normalized)
    } else {
        Err(AppError::validation(
            "subdomain",
            "must contain only letters, digits, hyphens and dots",
        ))
    }
}

/// Replace every stored plaintext key with its hash.
///
/// Rows that already carry a hash keep it (the hash has precedence) and only
/// lose the plaintext. All rewrites are applied in one batch.
pub async fn migrate_legacy_keys(store: &dyn ApiKeyStore) -> Result<MigrationReport, AppError> {
    let mut report = MigrationReport::default();
    let mut rewrites = Vec::new();

    for record in store.legacy_keys().await? {
        let Some(plaintext) = record.api_key.as_deref() else {
            continue;
        };
        match record.key_hash.as_deref() {
            Some(existing) => {
                rewrites.push((record.id, existing.to_owned()));
                report.cleared += 1;
            }
            None if is_well_formed(plaintext) => {
                rewrites.push((record.id, hash_api_key(plaintext)));
                report.migrated += 1;
            }
            None => {
                tracing::warn!(api_key_id = %record.id, "skipping malformed plaintext API key");
                report.skipped += 1;
            }
        }
    }

    if !rewrites.is_empty() {
        store.replace_legacy_keys(rewrites).await?;
    }

    tracing::info!(
        migrated = report.migrated,
        cleared = report.cleared,
        skipped = report.skipped,
        "legacy API key migration finished"
    );
    Ok(report)
}
