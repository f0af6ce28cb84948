//! Email dispatch: form type lookup, template rendering, delivery and audit.
//!
//! # Process
//!
//! 1. Validate the request body
//! 2. Resolve the active form type and its template (unknown ⇒ 400)
//! 3. Render subject and bodies with the caller's variables
//! 4. Hand the message to the transport
//! 5. Record an audit entry (best effort)

use std::collections::HashMap;

use crate::{
    error::AppError,
    middleware::auth::AuthContext,
    models::email::{
        DeliveryStatus, EmailAuditEntry, EmailSendResponse, EmailTemplate, FormType,
        NotifySubmissionRequest, OutgoingEmail, SendEmailRequest,
    },
    services::api_key_service::normalize_subdomain,
    state::AppState,
};

/// Send the template for `request.form_type`.
///
/// The recipient is `recipientEmail` or, failing that, the template's default.
/// The subdomain tag is the body's `subdomain`, else the authenticated one.
pub async fn send_form_email(
    state: &AppState,
    auth: &AuthContext,
    request: SendEmailRequest,
) -> Result<EmailSendResponse, AppError> {
    request.validate()?;

    let subdomain = match request.subdomain.as_deref().map(str::trim) {
        Some(tag) if !tag.is_empty() => normalize_subdomain(tag)?,
        _ => auth.subdomain.clone(),
    };

    let (form_type, template) = resolve_template(state, &request.form_type).await?;

    let recipient = request
        .recipient_email
        .or_else(|| template.default_recipient.clone())
        .ok_or_else(|| {
            AppError::validation(
                "recipientEmail",
                "is required because the template has no default recipient",
            )
        })?;

    let mut variables = request.variables;
    variables.insert("subdomain".to_string(), subdomain.clone());
    variables.insert("formType".to_string(), form_type.name.clone());

    let email = render_email(state, &template, &variables, recipient, None, &subdomain, &form_type);
    dispatch(state, auth, email).await?;

    Ok(EmailSendResponse {
        success: true,
        message: "Email sent successfully".to_string(),
        subdomain,
        form_type: form_type.name,
    })
}

/// Forward a website form submission to the subdomain's inbox.
///
/// The message goes to the template's default recipient or the configured
/// notification address; replies go to the submitter.
pub async fn notify_submission(
    state: &AppState,
    auth: &AuthContext,
    request: NotifySubmissionRequest,
) -> Result<EmailSendResponse, AppError> {
    request.validate()?;

    let (form_type, template) = resolve_template(state, &request.form_type).await?;

    let recipient = template
        .default_recipient
        .clone()
        .or_else(|| state.settings.notify_address.clone())
        .ok_or_else(|| {
            AppError::Configuration(format!(
                "no notification recipient for form type '{}'",
                form_type.name
            ))
        })?;

    let subject = request
        .subject
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("New {} submission", form_type.name));

    let variables = HashMap::from([
        ("name".to_string(), request.name.trim().to_owned()),
        ("email".to_string(), request.email.clone()),
        ("subject".to_string(), subject),
        ("message".to_string(), request.message.trim().to_owned()),
        ("subdomain".to_string(), auth.subdomain.clone()),
        ("formType".to_string(), form_type.name.clone()),
    ]);

    let email = render_email(
        state,
        &template,
        &variables,
        recipient,
        Some(request.email),
        &auth.subdomain,
        &form_type,
    );
    dispatch(state, auth, email).await?;

    Ok(EmailSendResponse {
        success: true,
        message: "Submission notification sent".to_string(),
        subdomain: auth.subdomain.clone(),
        form_type: form_type.name,
    })
}

async fn resolve_template(
    state: &AppState,
    form_type_name: &str,
) -> Result<(FormType, EmailTemplate), AppError> {
    let form_type = state
        .emails
        .find_form_type(form_type_name)
        .await?
        .ok_or_else(|| AppError::UnknownFormType(form_type_name.trim().to_owned()))?;

    let template = state
        .emails
        .active_template(form_type.id)
        .await?
        .ok_or_else(|| AppError::TemplateNotFound(form_type.name.clone()))?;

    Ok((form_type, template))
}

fn render_email(
    state: &AppState,
    template: &EmailTemplate,
    variables: &HashMap<String, String>,
    to: String,
    reply_to: Option<String>,
    subdomain: &str,
    form_type: &FormType,
) -> OutgoingEmail {
    OutgoingEmail {
        from: state.settings.from_address.clone(),
        to,
        reply_to,
        subject: render_subject(&template.subject, variables),
        html_body: render_template(&template.html_body, variables, true),
        text_body: template
            .text_body
            .as_deref()
            .map(|body| render_template(body, variables, false)),
        subdomain: subdomain.to_owned(),
        form_type: form_type.name.clone(),
    }
}

/// Send through the transport and write the audit entry.
async fn dispatch(state: &AppState, auth: &AuthContext, email: OutgoingEmail) -> Result<(), AppError> {
    let outcome = state.transport.send(&email).await;

    let entry = EmailAuditEntry {
        api_key_id: Some(auth.api_key_id),
        subdomain: email.subdomain.clone(),
        form_type: email.form_type.clone(),
        recipient: email.to.clone(),
        status: if outcome.is_ok() {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        },
        error: outcome.as_ref().err().map(|e| e.to_string()),
    };
    if let Err(e) = state.emails.record_delivery(entry).await {
        tracing::warn!(error = %e, "failed to write email audit entry");
    }

    match outcome {
        Ok(()) => {
            tracing::info!(
                api_key_id = %auth.api_key_id,
                subdomain = %email.subdomain,
                form_type = %email.form_type,
                transport = state.transport.name(),
                "email dispatched"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                api_key_id = %auth.api_key_id,
                subdomain = %email.subdomain,
                form_type = %email.form_type,
                error = %e,
                "email dispatch failed"
            );
            Err(e.into())
        }
    }
}

/// Replace `{{ name }}` placeholders. Unknown placeholders are left as written.
pub fn render_template(template: &str, variables: &HashMap<String, String>, escape: bool) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };

        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(value) if escape => output.push_str(&escape_html(value)),
            Some(value) => output.push_str(value),
            None => output.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    output
}

/// Render a subject line. Control characters (CR and LF included) become
/// spaces so caller values cannot start a new header.
pub fn render_subject(template: &str, variables: &HashMap<String, String>) -> String {
    let rendered: String = render_template(template, variables, false)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    rendered.trim().to_owned()
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_substituted() {
        let rendered = render_template(
            "Hello {{name}}, from {{ subdomain }}!",
            &vars(&[("name", "Ada"), ("subdomain", "shipping")]),
            false,
        );
        assert_eq!(rendered, "Hello Ada, from shipping!");
    }

    #[test]
    fn unknown_and_unterminated_placeholders_are_kept() {
        let variables = vars(&[("name", "Ada")]);
        assert_eq!(
            render_template("{{missing}} {{name}}", &variables, false),
            "{{missing}} Ada"
        );
        assert_eq!(
            render_template("Hi {{name", &variables, false),
            "Hi {{name"
        );
    }

    #[test]
    fn subject_lines_cannot_carry_extra_headers() {
        let subject = render_subject(
            "Message for {{subdomain}}",
            &vars(&[("subdomain", "x\r\nBcc: victim@evil.example")]),
        );
        assert_eq!(subject, "Message for x  Bcc: victim@evil.example");
        assert!(!subject.contains(['\r', '\n']));
    }

    #[test]
    fn html_rendering_escapes_values() {
        let rendered = render_template(
            "<p>{{message}}</p>",
            &vars(&[("message", "<script>alert('x')</script>")]),
            true,
        );
        assert_eq!(
            rendered,
            "<p>&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;</p>"
        );
    }
}
