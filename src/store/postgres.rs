//! PostgreSQL-backed store. Every query runs through [`PoolManager`].

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{ApiKeyStore, EmailStore, StoreError, duplicate_subdomain};
use crate::{
    db::PoolManager,
    models::{
        api_key::{ApiKeyRecord, NewApiKey, UpdateApiKeyRequest},
        email::{EmailAuditEntry, EmailTemplate, FormType},
    },
};

const API_KEY_COLUMNS: &str =
    "id, subdomain, api_key, key_hash, description, is_active, created_at, last_used_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: Arc<PoolManager>,
}

impl PgStore {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self { pool }
    }

    async fn fetch_keys(&self, sql: String) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let label = sql.clone();
        let keys = self
            .pool
            .with_connection(&label, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, ApiKeyRecord>(&sql)
                        .fetch_all(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(keys)
    }
}

#[async_trait]
impl ApiKeyStore for PgStore {
    async fn active_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.fetch_keys(format!(
            "SELECT {API_KEY_COLUMNS} FROM email_api_keys WHERE is_active = true ORDER BY created_at, id"
        ))
        .await
    }

    async fn touch_last_used(&self, id: Uuid) -> Result<(), StoreError> {
        self.pool
            .with_connection("UPDATE email_api_keys SET last_used_at", move |conn| {
                Box::pin(async move {
                    sqlx::query("UPDATE email_api_keys SET last_used_at = NOW() WHERE id = $1")
                        .bind(id)
                        .execute(&mut *conn)
                        .await
                        .map(|_| ())
                })
            })
            .await?;
        Ok(())
    }

    async fn insert(&self, key: NewApiKey) -> Result<ApiKeyRecord, StoreError> {
        let subdomain = key.subdomain.clone();
        let sql = format!(
            "INSERT INTO email_api_keys (subdomain, key_hash, description) VALUES ($1, $2, $3) RETURNING {API_KEY_COLUMNS}"
        );
        let label = sql.clone();
        self.pool
            .with_connection(&label, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, ApiKeyRecord>(&sql)
                        .bind(key.subdomain)
                        .bind(key.key_hash)
                        .bind(key.description)
                        .fetch_one(&mut *conn)
                        .await
                })
            })
            .await
            .map_err(|e| {
                if e.is_unique_violation() {
                    duplicate_subdomain(&subdomain)
                } else {
                    StoreError::Pool(e)
                }
            })
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.fetch_keys(format!(
            "SELECT {API_KEY_COLUMNS} FROM email_api_keys ORDER BY created_at DESC"
        ))
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApiKeyRecord>, StoreError> {
        let sql = format!("SELECT {API_KEY_COLUMNS} FROM email_api_keys WHERE id = $1");
        let label = sql.clone();
        let key = self
            .pool
            .with_connection(&label, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, ApiKeyRecord>(&sql)
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(key)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: UpdateApiKeyRequest,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        // COALESCE keeps columns the request leaves out
        let sql = format!(
            r#"
            UPDATE email_api_keys
            SET description = COALESCE($2, description),
                is_active = COALESCE($3, is_active)
            WHERE id = $1
            RETURNING {API_KEY_COLUMNS}
            "#
        );
        let label = sql.clone();
        let key = self
            .pool
            .with_connection(&label, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, ApiKeyRecord>(&sql)
                        .bind(id)
                        .bind(changes.description)
                        .bind(changes.is_active)
                        .fetch_optional(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(key)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = self
            .pool
            .with_connection("DELETE FROM email_api_keys", move |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM email_api_keys WHERE id = $1")
                        .bind(id)
                        .execute(&mut *conn)
                        .await
                        .map(|result| result.rows_affected() > 0)
                })
            })
            .await?;
        Ok(deleted)
    }

    async fn legacy_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        self.fetch_keys(format!(
            "SELECT {API_KEY_COLUMNS} FROM email_api_keys WHERE api_key IS NOT NULL ORDER BY created_at, id"
        ))
        .await
    }

    async fn replace_legacy_keys(&self, rewrites: Vec<(Uuid, String)>) -> Result<u64, StoreError> {
        let updated = self
            .pool
            .transaction("migrate legacy API keys", move |conn| {
                Box::pin(async move {
                    let mut updated = 0;
                    for (id, hash) in rewrites {
                        updated += sqlx::query(
                            "UPDATE email_api_keys SET key_hash = $2, api_key = NULL WHERE id = $1",
                        )
                        .bind(id)
                        .bind(hash)
                        .execute(&mut *conn)
                        .await?
                        .rows_affected();
                    }
                    Ok::<_, sqlx::Error>(updated)
                })
            })
            .await?;
        Ok(updated)
    }
}

#[async_trait]
impl EmailStore for PgStore {
    async fn active_form_types(&self) -> Result<Vec<FormType>, StoreError> {
        const SQL: &str = "SELECT id, name, description, is_active, created_at FROM email_form_types WHERE is_active = true ORDER BY name";
        let form_types = self
            .pool
            .with_connection(SQL, |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, FormType>(SQL)
                        .fetch_all(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(form_types)
    }

    async fn find_form_type(&self, name: &str) -> Result<Option<FormType>, StoreError> {
        const SQL: &str = "SELECT id, name, description, is_active, created_at FROM email_form_types WHERE lower(name) = lower($1) AND is_active = true";
        let name = name.trim().to_owned();
        let form_type = self
            .pool
            .with_connection(SQL, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, FormType>(SQL)
                        .bind(name)
                        .fetch_optional(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(form_type)
    }

    async fn active_template(&self, form_type_id: Uuid) -> Result<Option<EmailTemplate>, StoreError> {
        const SQL: &str = r#"
            SELECT id, form_type_id, subject, html_body, text_body, default_recipient, is_active, updated_at
            FROM email_templates
            WHERE form_type_id = $1 AND is_active = true
            ORDER BY updated_at DESC
            LIMIT 1
        "#;
        let template = self
            .pool
            .with_connection(SQL, move |conn| {
                Box::pin(async move {
                    sqlx::query_as::<_, EmailTemplate>(SQL)
                        .bind(form_type_id)
                        .fetch_optional(&mut *conn)
                        .await
                })
            })
            .await?;
        Ok(template)
    }

    async fn record_delivery(&self, entry: EmailAuditEntry) -> Result<(), StoreError> {
        const SQL: &str = r#"
            INSERT INTO email_logs (api_key_id, subdomain, form_type, recipient, status, error)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#;
        self.pool
            .with_connection(SQL, move |conn| {
                Box::pin(async move {
                    sqlx::query(SQL)
                        .bind(entry.api_key_id)
                        .bind(entry.subdomain)
                        .bind(entry.form_type)
                        .bind(entry.recipient)
                        .bind(entry.status.as_str())
                        .bind(entry.error)
                        .execute(&mut *conn)
                        .await
                        .map(|_| ())
                })
            })
            .await?;
        Ok(())
    }
}
