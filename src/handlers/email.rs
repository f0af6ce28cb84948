//! Email API HTTP handlers.
//!
//! This module implements the cross-subdomain email endpoints:
//! - POST /api/email/send - Render and send the template for a form type
//! - POST /api/email/notify-submission - Forward a website form submission
//! - GET /api/email/form-types - List active form types
//!
//! All three run behind API key authentication; the two POST routes are also
//! rate limited by form type.

use axum::{Extension, Json, extract::State};

use crate::{
    error::AppError,
    extract::ValidatedJson,
    middleware::auth::AuthContext,
    models::email::{EmailSendResponse, FormTypesResponse, NotifySubmissionRequest, SendEmailRequest},
    services::email_service,
    state::AppState,
};

/// Send an email for a form type.
///
/// # Request Body
///
/// ```json
/// {
///   "formType": "contact",
///   "recipientEmail": "ops@example.com",
///   "variables": { "name": "Ada" }
/// }
/// ```
///
/// # Response
///
/// - **Success (200)**: `{ "success": true, "message": "...", "subdomain": "...", "formType": "contact" }`
/// - **Error (400)**: Invalid body, unknown form type or missing template
/// - **Error (401)**: Invalid API key
/// - **Error (429)**: Rate limit exceeded
/// - **Error (500)**: Database or relay failure
pub async fn send_email(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ValidatedJson(request): ValidatedJson<SendEmailRequest>,
) -> Result<Json<EmailSendResponse>, AppError> {
    let response = email_service::send_form_email(&state, &auth, request).await?;
    Ok(Json(response))
}

/// Forward a contact-form style submission to the subdomain's inbox.
pub async fn notify_submission(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    ValidatedJson(request): ValidatedJson<NotifySubmissionRequest>,
) -> Result<Json<EmailSendResponse>, AppError> {
    let response = email_service::notify_submission(&state, &auth, request).await?;
    Ok(Json(response))
}

/// List the active form types.
pub async fn list_form_types(
    State(state): State<AppState>,
) -> Result<Json<FormTypesResponse>, AppError> {
    let form_types = state.emails.active_form_types().await?;
    Ok(Json(FormTypesResponse { form_types }))
}
