//! End-to-end tests for the email API.
//!
//! The router runs against the in-memory store and a transport that records
//! every message instead of delivering it. No database is required.

use std::{collections::HashSet, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header::RETRY_AFTER},
};
use molo_email_api::{
    db::{PoolManager, PoolSettings},
    middleware::rate_limit::{EmailLimiters, RateLimitPolicy, Whitelist},
    models::email::{DeliveryStatus, OutgoingEmail},
    router::build_router,
    services::{
        api_key_service::hash_api_key,
        transport::{EmailTransport, TransportError, TransportHealth},
    },
    state::{ApiSettings, AppState},
    store::{ApiKeyStore, memory::MemoryStore},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-secret";

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        self.sent.lock().push(email.clone());
        Ok(())
    }

    async fn check(&self) -> TransportHealth {
        TransportHealth::Connected
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    transport: Arc<RecordingTransport>,
}

impl TestApp {
    fn new() -> Self {
        Self::with_limiters(limiters(10, Whitelist::default()))
    }

    fn with_limiters(limiters: EmailLimiters) -> Self {
        let store = Arc::new(MemoryStore::new());
        let contact = store.add_form_type("contact", true);
        store.add_template(
            contact.id,
            "Message for {{subdomain}}",
            "<p>Hello {{name}}</p>",
            Some("inbox@example.com"),
        );
        let login = store.add_form_type("login", true);
        store.add_template(login.id, "Your login code", "<p>{{code}}</p>", None);
        store.add_form_type("retired", false);

        let transport = Arc::new(RecordingTransport::default());
        let state = AppState {
            pool: Arc::new(PoolManager::new(PoolSettings::default())),
            api_keys: store.clone(),
            emails: store.clone(),
            transport: transport.clone(),
            limiters: Arc::new(limiters),
            settings: Arc::new(ApiSettings {
                from_address: "no-reply@example.com".to_string(),
                notify_address: None,
                admin_token: Some(ADMIN_TOKEN.to_string()),
                trust_proxy_headers: false,
            }),
        };

        Self {
            router: build_router(state),
            store,
            transport,
        }
    }

    /// Issue a key through the admin API and return the raw value.
    async fn issue_key(&self, subdomain: &str) -> String {
        let (status, body) = self
            .call(admin_request(
                "POST",
                "/admin/api-keys",
                Some(json!({ "subdomain": subdomain })),
            ))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["key"].as_str().unwrap().to_string()
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = self.call_with_headers(request).await;
        (status, body)
    }

    async fn call_with_headers(
        &self,
        request: Request<Body>,
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }
}

fn limiters(general: u32, whitelist: Whitelist) -> EmailLimiters {
    EmailLimiters::new(
        RateLimitPolicy::new(general, Duration::from_secs(60)),
        RateLimitPolicy::new(5, Duration::from_secs(60)),
        RateLimitPolicy::new(3, Duration::from_secs(900)),
        whitelist,
    )
}

fn email_request(uri: &str, api_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {ADMIN_TOKEN}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn contact_email() -> Value {
    json!({ "formType": "contact", "variables": { "name": "Ada" } })
}

#[tokio::test]
async fn send_with_valid_key_delivers_rendered_template() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let (status, headers, body) = app
        .call_with_headers(email_request("/api/email/send", Some(&key), contact_email()))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["subdomain"], "shipping.example");
    assert_eq!(body["formType"], "contact");
    assert_eq!(headers["x-ratelimit-limit"], "10");
    assert_eq!(headers["x-ratelimit-remaining"], "9");

    let sent = app.transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "inbox@example.com");
    assert_eq!(sent[0].subject, "Message for shipping.example");
    assert_eq!(sent[0].html_body, "<p>Hello Ada</p>");

    let audit = app.store.audit_log();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn unknown_form_type_is_rejected() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    for form_type in ["does-not-exist", "retired"] {
        let (status, body) = app
            .call(email_request(
                "/api/email/send",
                Some(&key),
                json!({ "formType": form_type, "recipientEmail": "a@example.com" }),
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "unknown_form_type");
    }
    assert!(app.transport.sent.lock().is_empty());
}

#[tokio::test]
async fn missing_or_wrong_key_is_unauthorized() {
    let app = TestApp::new();
    app.issue_key("shipping.example").await;

    let (status, missing) = app
        .call(email_request("/api/email/send", None, contact_email()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing["error"]["code"], "invalid_api_key");

    let (status, wrong) = app
        .call(email_request(
            "/api/email/send",
            Some("molo_not-a-real-key"),
            contact_email(),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(missing, wrong);
}

#[tokio::test]
async fn deactivated_key_is_unauthorized() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;
    let id = app.store.list().await.unwrap()[0].id;

    let (status, body) = app
        .call(admin_request(
            "PATCH",
            &format!("/admin/api-keys/{id}"),
            Some(json!({ "isActive": false })),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], false);

    let (status, _) = app
        .call(email_request("/api/email/send", Some(&key), contact_email()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn eleventh_request_in_window_is_rate_limited() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    for _ in 0..10 {
        let (status, _) = app
            .call(email_request("/api/email/send", Some(&key), contact_email()))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, headers, body) = app
        .call_with_headers(email_request("/api/email/send", Some(&key), contact_email()))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(headers[RETRY_AFTER], retry_after.to_string().as_str());
    assert_eq!(app.transport.sent.lock().len(), 10);
}

#[tokio::test]
async fn auth_flows_use_their_own_quota() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;
    let login = json!({
        "formType": "login",
        "recipientEmail": "ada@example.com",
        "variables": { "code": "123456" }
    });

    for _ in 0..5 {
        let (status, _) = app
            .call(email_request("/api/email/send", Some(&key), login.clone()))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = app
        .call(email_request("/api/email/send", Some(&key), login))
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // The general limiter is untouched by login traffic.
    let (status, _) = app
        .call(email_request("/api/email/send", Some(&key), contact_email()))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn whitelisted_key_is_never_limited() {
    let whitelisted = "molo_whitelisted-load-test-key";
    let whitelist = Whitelist::new(
        Vec::<IpAddr>::new(),
        HashSet::from([whitelisted.to_string()]),
    );
    let app = TestApp::with_limiters(limiters(1, whitelist));
    app.store.insert_legacy_key("loadtest.example", whitelisted);

    for _ in 0..3 {
        let (status, headers, _) = app
            .call_with_headers(email_request(
                "/api/email/send",
                Some(whitelisted),
                contact_email(),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn rotating_bogus_keys_are_eventually_limited() {
    let app = TestApp::with_limiters(limiters(1, Whitelist::default()).with_max_tracked_keys(20));
    let padding = "f".repeat(200);

    let mut statuses = Vec::new();
    for i in 0..40 {
        let bogus = format!("molo_bogus{i}{padding}");
        let (status, _) = app
            .call(email_request("/api/email/send", Some(&bogus), contact_email()))
            .await;
        statuses.push(status);
    }

    assert!(statuses[..20].iter().all(|s| *s == StatusCode::UNAUTHORIZED));
    assert!(statuses[20..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
    assert!(app.transport.sent.lock().is_empty());
}

#[tokio::test]
async fn subdomain_tags_must_be_valid_hostnames() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let (status, body) = app
        .call(email_request(
            "/api/email/send",
            Some(&key),
            json!({
                "formType": "contact",
                "subdomain": "x\r\nBcc: victim@evil.example"
            }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["field"], "subdomain");

    let mut request = email_request("/api/email/send", Some(&key), contact_email());
    request
        .headers_mut()
        .insert("x-subdomain", "not a host!".parse().unwrap());
    let (status, body) = app.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["field"], "subdomain");

    let (status, body) = app
        .call(email_request(
            "/api/email/send",
            Some(&key),
            json!({ "formType": "contact", "subdomain": "Docs.Example" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subdomain"], "docs.example");

    let sent = app.transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Message for docs.example");
}

#[tokio::test]
async fn legacy_plaintext_key_survives_migration() {
    let app = TestApp::new();
    let raw = "molo_legacy0123456789abcdef";
    let record = app.store.insert_legacy_key("legacy.example", raw);

    let (status, _) = app
        .call(email_request("/api/email/send", Some(raw), contact_email()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, report) = app
        .call(admin_request("POST", "/admin/api-keys/migrate", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["migrated"], 1);

    let migrated = app.store.get(record.id).await.unwrap().unwrap();
    assert_eq!(migrated.api_key, None);
    assert_eq!(migrated.key_hash, Some(hash_api_key(raw)));

    let (status, _) = app
        .call(email_request("/api/email/send", Some(raw), contact_email()))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = app.call(admin_request("GET", "/admin/api-keys", None)).await;
    assert_eq!(listed[0]["legacy"], false);
    assert!(listed[0].get("key").is_none());
}

#[tokio::test]
async fn subdomain_header_and_body_override_key_subdomain() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let mut request = email_request("/api/email/send", Some(&key), contact_email());
    request
        .headers_mut()
        .insert("x-subdomain", "billing.example".parse().unwrap());
    let (status, body) = app.call(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subdomain"], "billing.example");

    let (_, body) = app
        .call(email_request(
            "/api/email/send",
            Some(&key),
            json!({ "formType": "contact", "subdomain": "docs.example" }),
        ))
        .await;
    assert_eq!(body["subdomain"], "docs.example");
}

#[tokio::test]
async fn form_types_lists_active_entries_only() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let request = Request::builder()
        .uri("/api/email/form-types")
        .header("x-api-key", &key)
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.call(request).await;

    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["formTypes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["contact", "login"]);
}

#[tokio::test]
async fn notify_submission_replies_to_submitter() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let (status, body) = app
        .call(email_request(
            "/api/email/notify-submission",
            Some(&key),
            json!({
                "formType": "contact",
                "name": "Ada Lovelace",
                "email": "ada@example.com",
                "message": "Hello there"
            }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let sent = app.transport.sent.lock().clone();
    assert_eq!(sent[0].to, "inbox@example.com");
    assert_eq!(sent[0].reply_to.as_deref(), Some("ada@example.com"));
    assert_eq!(sent[0].html_body, "<p>Hello Ada Lovelace</p>");
}

#[tokio::test]
async fn malformed_bodies_return_invalid_request() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;

    let (status, body) = app
        .call(email_request(
            "/api/email/send",
            Some(&key),
            json!({ "formType": "contact", "unexpected": true }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request");

    let (status, body) = app
        .call(email_request(
            "/api/email/send",
            Some(&key),
            json!({ "formType": "login" }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["field"], "recipientEmail");
}

#[tokio::test]
async fn admin_routes_require_bearer_token() {
    let app = TestApp::new();

    let request = Request::builder()
        .uri("/admin/api-keys")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.call(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/admin/pool-stats")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.call(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_key_lifecycle() {
    let app = TestApp::new();
    let key = app.issue_key("shipping.example").await;
    assert!(key.starts_with("molo_"));

    let (status, body) = app
        .call(admin_request(
            "POST",
            "/admin/api-keys",
            Some(json!({ "subdomain": "shipping.example" })),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let id = app.store.list().await.unwrap()[0].id;
    let (status, body) = app
        .call(admin_request("GET", &format!("/admin/api-keys/{id}"), None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["keyPreview"].as_str().unwrap().starts_with("sha256:"));

    let (status, _) = app
        .call(admin_request(
            "PATCH",
            &format!("/admin/api-keys/{id}"),
            Some(json!({})),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(admin_request("DELETE", &format!("/admin/api-keys/{id}"), None))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _) = app
        .call(admin_request("DELETE", &format!("/admin/api-keys/{id}"), None))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(email_request("/api/email/send", Some(&key), contact_email()))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn email_health_is_public() {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/api/email/health")
        .body(Body::empty())
        .unwrap();

    let (status, body) = app.call(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connectivity"], "connected");
    assert_eq!(body["transport"], "recording");
}
