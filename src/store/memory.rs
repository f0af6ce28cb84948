//! In-process store used by tests and local runs without PostgreSQL.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{ApiKeyStore, EmailStore, StoreError, duplicate_subdomain};
use crate::models::{
    api_key::{ApiKeyRecord, NewApiKey, UpdateApiKeyRequest},
    email::{EmailAuditEntry, EmailTemplate, FormType},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: RwLock<Vec<ApiKeyRecord>>,
    form_types: RwLock<Vec<FormType>>,
    templates: RwLock<Vec<EmailTemplate>>,
    audit: RwLock<Vec<EmailAuditEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-migration row holding the raw key.
    pub fn insert_legacy_key(&self, subdomain: &str, plaintext: &str) -> ApiKeyRecord {
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            subdomain: subdomain.to_owned(),
            api_key: Some(plaintext.to_owned()),
            key_hash: None,
            description: None,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.keys.write().push(record.clone());
        record
    }

    pub fn add_form_type(&self, name: &str, is_active: bool) -> FormType {
        let form_type = FormType {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            description: None,
            is_active,
            created_at: Utc::now(),
        };
        self.form_types.write().push(form_type.clone());
        form_type
    }

    pub fn add_template(
        &self,
        form_type_id: Uuid,
        subject: &str,
        html_body: &str,
        default_recipient: Option<&str>,
    ) -> EmailTemplate {
        let template = EmailTemplate {
            id: Uuid::new_v4(),
            form_type_id,
            subject: subject.to_owned(),
            html_body: html_body.to_owned(),
            text_body: None,
            default_recipient: default_recipient.map(str::to_owned),
            is_active: true,
            updated_at: Utc::now(),
        };
        self.templates.write().push(template.clone());
        template
    }

    /// Audit entries in insertion order.
    pub fn audit_log(&self) -> Vec<EmailAuditEntry> {
        self.audit.read().clone()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn active_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(self
            .keys
            .read()
            .iter()
            .filter(|k| k.is_active)
            .cloned()
            .collect())
    }

    async fn touch_last_used(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some(key) = self.keys.write().iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn insert(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError> {
        let mut keys = self.keys.write();
        if keys.iter().any(|k| k.subdomain == key.subdomain) {
            return Err(duplicate_subdomain(&key.subdomain));
        }
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            subdomain: key.subdomain,
            api_key: None,
            key_hash: Some(key.key_hash),
            description: key.description,
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        keys.push(record.clone());
        Ok(record)
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let mut keys = self.keys.read().clone();
        keys.reverse();
        Ok(keys)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.keys.read().iter().find(|k| k.id == id).cloned())
    }

    async fn update(
        &self,
        id: Uuid,
        changes: UpdateApiKeyRequest,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        let mut keys = self.keys.write();
        let Some(key) = keys.iter_mut().find(|k| k.id == id) else {
            return Ok(None);
        };
        if let Some(description) = changes.description {
            key.description = Some(description);
        }
        if let Some(is_active) = changes.is_active {
            key.is_active = is_active;
        }
        Ok(Some(key.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|k| k.id != id);
        Ok(keys.len() != before)
    }

    async fn legacy_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(self
            .keys
            .read()
            .iter()
            .filter(|k| k.api_key.is_some())
            .cloned()
            .collect())
    }

    async fn replace_legacy_keys(&self, rewrites: Vec<(Uuid, String)>) -> Result<u64, StoreError> {
        let mut keys = self.keys.write();
        let mut updated = 0;
        for (id, hash) in rewrites {
            if let Some(key) = keys.iter_mut().find(|k| k.id == id) {
                key.key_hash = Some(hash);
                key.api_key = None;
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn active_form_types(&self) -> Result<Vec<FormType>, StoreError> {
        Ok(self
            .form_types
            .read()
            .iter()
            .filter(|f| f.is_active)
            .cloned()
            .collect())
    }

    async fn find_form_type(&self, name: &str) -> Result<Option<FormType>, StoreError> {
        let name = name.trim();
        Ok(self
            .form_types
            .read()
            .iter()
            .find(|f| f.is_active && f.name.eq_ignore_ascii_case(name))
            .cloned())
    }

    async fn active_template(&self, form_type_id: Uuid) -> Result<Option<EmailTemplate>, StoreError> {
        Ok(self
            .templates
            .read()
            .iter()
            .filter(|t| t.is_active && t.form_type_id == form_type_id)
            .max_by_key(|t| t.updated_at)
            .cloned())
    }

    async fn record_delivery(&self, entry: EmailAuditEntry) -> Result<(), StoreError> {
        self.audit.write().push(entry);
        Ok(())
    }
}
