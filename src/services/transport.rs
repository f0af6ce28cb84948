//! Outbound email transports.
//!
//! Messages are handed to an HTTP email relay. Each request is signed with
//! HMAC-SHA256 so the relay can verify it came from this service.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::{config::Config, models::email::OutgoingEmail};

type HmacSha256 = Hmac<Sha256>;

/// Timeout for a single relay request.
const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("email relay request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("email relay rejected the message with status {status}")]
    Rejected { status: u16, body: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),
}

/// Connectivity as reported by `GET /api/email/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportHealth {
    Connected,
    Unreachable,
    Unconfigured,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError>;

    async fn check(&self) -> TransportHealth;

    fn name(&self) -> &'static str;
}

/// Delivers messages by POSTing JSON to an email relay.
///
/// # Headers Sent
///
/// - `Content-Type: application/json`
/// - `Authorization: Bearer <token>` when a token is configured
/// - `X-Relay-Signature: sha256=<hex>` when a signing secret is configured
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    client: reqwest::Client,
    endpoint: url::Url,
    token: Option<String>,
    signing_secret: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(
        endpoint: url::Url,
        token: Option<String>,
        signing_secret: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(RELAY_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint,
            token,
            signing_secret,
        })
    }
}

#[async_trait]
impl EmailTransport for HttpRelayTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        let payload = serde_json::to_string(email)?;

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(secret) = &self.signing_secret {
            request = request.header("X-Relay-Signature", sign_payload(secret, &payload));
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        tracing::debug!(status = status.as_u16(), to = %email.to, "email accepted by relay");
        Ok(())
    }

    async fn check(&self) -> TransportHealth {
        match self.client.get(self.endpoint.clone()).send().await {
            Ok(response) if !response.status().is_server_error() => TransportHealth::Connected,
            Ok(response) => {
                tracing::warn!(status = response.status().as_u16(), "email relay unhealthy");
                TransportHealth::Unreachable
            }
            Err(e) => {
                tracing::warn!(error = %e, "email relay unreachable");
                TransportHealth::Unreachable
            }
        }
    }

    fn name(&self) -> &'static str {
        "http-relay"
    }
}

/// Logs messages instead of delivering them. Used when no relay is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            subdomain = %email.subdomain,
            form_type = %email.form_type,
            "email relay not configured; message logged only"
        );
        Ok(())
    }

    async fn check(&self) -> TransportHealth {
        TransportHealth::Unconfigured
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Pick the transport described by the configuration.
pub fn from_config(config: &Config) -> Result<Arc<dyn EmailTransport>, TransportError> {
    match config.email_relay_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            let endpoint = validate_relay_url(url)?;
            Ok(Arc::new(HttpRelayTransport::new(
                endpoint,
                config.email_relay_token.clone(),
                config.email_relay_secret.clone(),
            )?))
        }
        _ => {
            tracing::warn!("EMAIL_RELAY_URL not set; outgoing email will only be logged");
            Ok(Arc::new(LogTransport))
        }
    }
}

/// Generate HMAC-SHA256 signature for a relay payload.
///
/// # Format
///
/// `sha256=<hex_encoded_hmac>`
pub fn sign_payload(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC key length is valid");
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    format!("sha256={}", hex::encode(result.into_bytes()))
}

/// Validate relay URL format.
///
/// # Rules
///
/// - Must be valid URL
/// - Must be HTTPS (HTTP localhost allowed for development)
pub fn validate_relay_url(raw: &str) -> Result<url::Url, TransportError> {
    let parsed = url::Url::parse(raw)
        .map_err(|_| TransportError::InvalidUrl("Invalid URL format".to_string()))?;

    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "0.0.0.0")) => {
            Ok(parsed)
        }
        "http" => Err(TransportError::InvalidUrl(
            "HTTP is only allowed for localhost. Use HTTPS for production.".to_string(),
        )),
        _ => Err(TransportError::InvalidUrl(
            "URL must use HTTP or HTTPS".to_string(),
        )),
    }
}
