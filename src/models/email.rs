//! Email form types, templates and request/response bodies.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

const MAX_FORM_TYPE_LEN: usize = 100;
const MAX_VARIABLES: usize = 50;
const MAX_VARIABLE_VALUE_LEN: usize = 10_000;
const MAX_NAME_LEN: usize = 200;
const MAX_SUBJECT_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 10_000;
const MAX_EMAIL_LEN: usize = 254;

/// A form type callers may name in `formType`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormType {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Template rendered for a form type. `{{name}}` placeholders are substituted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmailTemplate {
    pub id: Uuid,
    pub form_type_id: Uuid,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    /// Used when the request names no recipient.
    pub default_recipient: Option<String>,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// Request body for `POST /api/email/send`.
///
/// # Example
///
/// ```json
/// {
///   "formType": "contact",
///   "recipientEmail": "ops@example.com",
///   "variables": { "name": "Ada" },
///   "subdomain": "shipping"
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendEmailRequest {
    pub form_type: String,
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub subdomain: Option<String>,
}

impl SendEmailRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_form_type(&self.form_type)?;

        if let Some(recipient) = &self.recipient_email {
            if !is_valid_email(recipient) {
                return Err(AppError::validation(
                    "recipientEmail",
                    "must be a valid email address",
                ));
            }
        }

        if self.variables.len() > MAX_VARIABLES {
            return Err(AppError::validation(
                "variables",
                format!("at most {MAX_VARIABLES} variables are allowed"),
            ));
        }
        for (name, value) in &self.variables {
            if name.trim().is_empty() {
                return Err(AppError::validation(
                    "variables",
                    "variable names must not be empty",
                ));
            }
            if value.len() > MAX_VARIABLE_VALUE_LEN {
                return Err(AppError::validation(
                    "variables",
                    format!("value of '{name}' exceeds {MAX_VARIABLE_VALUE_LEN} characters"),
                ));
            }
        }

        Ok(())
    }
}

/// Request body for `POST /api/email/notify-submission`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NotifySubmissionRequest {
    pub form_type: String,
    pub name: String,
    pub email: String,
    pub subject: Option<String>,
    pub message: String,
}

impl NotifySubmissionRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_form_type(&self.form_type)?;

        let name = self.name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(AppError::validation(
                "name",
                format!("must be between 1 and {MAX_NAME_LEN} characters"),
            ));
        }
        if !is_valid_email(&self.email) {
            return Err(AppError::validation("email", "must be a valid email address"));
        }
        if let Some(subject) = &self.subject {
            if subject.len() > MAX_SUBJECT_LEN {
                return Err(AppError::validation(
                    "subject",
                    format!("must be at most {MAX_SUBJECT_LEN} characters"),
                ));
            }
        }
        let message = self.message.trim();
        if message.is_empty() || message.len() > MAX_MESSAGE_LEN {
            return Err(AppError::validation(
                "message",
                format!("must be between 1 and {MAX_MESSAGE_LEN} characters"),
            ));
        }

        Ok(())
    }
}

/// Response for send and notify calls.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSendResponse {
    pub success: bool,
    pub message: String,
    pub subdomain: String,
    pub form_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormTypesResponse {
    pub form_types: Vec<FormType>,
}

/// A rendered message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    pub subdomain: String,
    pub form_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// One row of the `email_logs` audit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAuditEntry {
    pub api_key_id: Option<Uuid>,
    pub subdomain: String,
    pub form_type: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}

fn validate_form_type(form_type: &str) -> Result<(), AppError> {
    let trimmed = form_type.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("formType", "is required"));
    }
    if trimmed.len() > MAX_FORM_TYPE_LEN {
        return Err(AppError::validation(
            "formType",
            format!("must be at most {MAX_FORM_TYPE_LEN} characters"),
        ));
    }
    Ok(())
}

/// Structural address check: one `@`, non-empty local part, dotted domain, no whitespace.
pub fn is_valid_email(address: &str) -> bool {
    if address.is_empty() || address.len() > MAX_EMAIL_LEN {
        return false;
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
