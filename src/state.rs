//! Shared application state handed to every handler and middleware.

use std::sync::Arc;

use crate::{
    config::Config,
    db::PoolManager,
    middleware::rate_limit::EmailLimiters,
    services::transport::EmailTransport,
    store::{ApiKeyStore, EmailStore},
};

/// Request-independent settings read once at startup.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub from_address: String,
    /// Fallback recipient for submission notifications.
    pub notify_address: Option<String>,
    /// Bearer token for `/admin`. `None` disables the admin API.
    pub admin_token: Option<String>,
    pub trust_proxy_headers: bool,
}

impl ApiSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            from_address: config.email_from_address.clone(),
            notify_address: config
                .email_notify_address
                .clone()
                .filter(|a| !a.trim().is_empty()),
            admin_token: config
                .admin_api_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub emails: Arc<dyn EmailStore>,
    pub transport: Arc<dyn EmailTransport>,
    pub limiters: Arc<EmailLimiters>,
    pub settings: Arc<ApiSettings>,
}
