//! Persistence seams for API keys and email catalogue data.
//!
//! Handlers and services only see these traits. [`postgres::PgStore`] backs
//! them in production; [`memory::MemoryStore`] keeps everything in process for
//! tests and local runs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::PoolError,
    models::{
        api_key::{ApiKeyRecord, NewApiKey, UpdateApiKeyRequest},
        email::{EmailAuditEntry, EmailTemplate, FormType},
    },
};

pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A unique column (e.g. `subdomain`) already holds the value.
    #[error("{0}")]
    Duplicate(String),
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Active keys in storage order.
    async fn active_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError>;

    async fn touch_last_used(&self, id: Uuid) -> Result<(), StoreError>;

    async fn insert(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError>;

    /// Every key, active or not, newest first.
    async fn list(&self) -> Result<Vec<ApiKeyRecord>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ApiKeyRecord>, StoreError>;

    async fn update(
        &self,
        id: Uuid,
        changes: UpdateApiKeyRequest,
    ) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Hard delete. Returns false when no row matched.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Rows that still store a plaintext key.
    async fn legacy_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Set `key_hash` and clear the plaintext for each `(id, hash)` pair, atomically.
    async fn replace_legacy_keys(&self, rewrites: Vec<(Uuid, String)>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait EmailStore: Send + Sync {
    async fn active_form_types(&self) -> Result<Vec<FormType>, StoreError>;

    /// Active form type by name, case-insensitive.
    async fn find_form_type(&self, name: &str) -> Result<Option<FormType>, StoreError>;

    /// Most recently updated active template for the form type.
    async fn active_template(&self, form_type_id: Uuid) -> Result<Option<EmailTemplate>, StoreError>;

    async fn record_delivery(&self, entry: EmailAuditEntry) -> Result<(), StoreError>;
}

fn duplicate_subdomain(subdomain: &str) -> StoreError {
    StoreError::Duplicate(format!("An API key for subdomain '{subdomain}' already exists"))
}
