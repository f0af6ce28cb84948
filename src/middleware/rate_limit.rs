//! Form-type aware rate limiting for the email endpoints.
//!
//! Three independent fixed-window limiters exist: general, auth and
//! password-reset. The request's `formType` picks one; counters are keyed by
//! `apiKey:ip` and never shared between limiters. Whitelisted IPs and keys
//! skip limiting before any counter is touched.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    error::AppError,
    middleware::auth::API_KEY_HEADER,
    services::api_key_service::{hash_api_key, is_well_formed},
    state::AppState,
};

/// Largest body the limiter will buffer while looking for `formType`.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Counters a limiter keeps before it refuses to open windows for new keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Which policy a form type falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    General,
    Auth,
    PasswordReset,
}

impl LimiterKind {
    /// Case-insensitive substring classification. Password-reset wins over auth.
    pub fn classify(form_type: &str) -> Self {
        let form_type = form_type.to_ascii_lowercase();
        if form_type.contains("password") || form_type.contains("reset") {
            LimiterKind::PasswordReset
        } else if ["login", "register", "signup", "verify"]
            .iter()
            .any(|needle| form_type.contains(needle))
        {
            LimiterKind::Auth
        } else {
            LimiterKind::General
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::General => "general",
            LimiterKind::Auth => "auth",
            LimiterKind::PasswordReset => "password_reset",
        }
    }
}

/// Quota for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

/// IPs and API keys exempt from limiting.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ips: HashSet<IpAddr>,
    keys: HashSet<String>,
}

impl Whitelist {
    pub fn new(ips: impl IntoIterator<Item = IpAddr>, keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            ips: ips.into_iter().collect(),
            keys: keys.into_iter().collect(),
        }
    }

    /// Parse configured IP strings, skipping (and logging) unparseable entries.
    pub fn from_lists(ips: &[String], keys: &[String]) -> Self {
        let parsed = ips.iter().filter_map(|ip| match ip.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(entry = %ip, "ignoring invalid rate limit whitelist IP");
                None
            }
        });
        Self::new(parsed.collect::<Vec<_>>(), keys.iter().cloned())
    }

    pub fn bypasses(&self, ip: Option<IpAddr>, api_key: Option<&str>) -> bool {
        ip.is_some_and(|ip| self.ips.contains(&ip))
            || api_key.is_some_and(|key| self.keys.contains(key))
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counts requests per key in fixed windows that start with the key's first request.
#[derive(Debug)]
///
/// At most `max_tracked_keys` windows are held. Once full, a key without a
/// live window is rejected until an existing window expires.
pub struct FixedWindowLimiter {
    kind: LimiterKind,
    policy: RateLimitPolicy,
    max_tracked_keys: usize,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new(kind: LimiterKind, policy: RateLimitPolicy) -> Self {
        Self::with_capacity(kind, policy, DEFAULT_MAX_TRACKED_KEYS)
    }

    pub fn with_capacity(kind: LimiterKind, policy: RateLimitPolicy, max_tracked_keys: usize) -> Self {
        Self {
            kind,
            policy,
            max_tracked_keys: max_tracked_keys.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> LimiterKind {
        self.kind
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Count one request for `key`.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut windows = self.windows.lock();

        if !windows.contains_key(key) && windows.len() >= self.max_tracked_keys {
            let window = self.policy.window;
            windows.retain(|_, w| now.saturating_duration_since(w.started) < window);
            if windows.len() >= self.max_tracked_keys {
                let soonest = windows
                    .values()
                    .map(|w| window.saturating_sub(now.saturating_duration_since(w.started)))
                    .min()
                    .unwrap_or(window);
                tracing::warn!(
                    limiter = self.kind.as_str(),
                    tracked = windows.len(),
                    "rate limit table full; rejecting new key"
                );
                return Decision::Rejected {
                    retry_after_secs: self.retry_after(soonest),
                };
            }
        }

        let window = windows.entry(key.to_owned()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(window.started) >= self.policy.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.policy.max_requests {
            let remaining = self
                .policy
                .window
                .saturating_sub(now.saturating_duration_since(window.started));
            return Decision::Rejected {
                retry_after_secs: self.retry_after(remaining),
            };
        }

        window.count += 1;
        Decision::Allowed {
            remaining: self.policy.max_requests - window.count,
        }
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.started) < self.policy.window);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Whole seconds until `remaining` elapses, between 1 and the window length.
    fn retry_after(&self, remaining: Duration) -> u64 {
        let ceiling = ceil_secs(self.policy.window).max(1);
        ceil_secs(remaining).clamp(1, ceiling)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000) as u64
}

/// The three email limiters plus the shared whitelist.
#[derive(Debug)]
pub struct EmailLimiters {
    general: FixedWindowLimiter,
    auth: FixedWindowLimiter,
    password_reset: FixedWindowLimiter,
    whitelist: Whitelist,
}

impl EmailLimiters {
    pub fn new(
        general: RateLimitPolicy,
        auth: RateLimitPolicy,
        password_reset: RateLimitPolicy,
        whitelist: Whitelist,
    ) -> Self {
        Self {
            general: FixedWindowLimiter::new(LimiterKind::General, general),
            auth: FixedWindowLimiter::new(LimiterKind::Auth, auth),
            password_reset: FixedWindowLimiter::new(LimiterKind::PasswordReset, password_reset),
            whitelist,
        }
    }

    /// Apply one table capacity to all three limiters.
    pub fn with_max_tracked_keys(self, max_tracked_keys: usize) -> Self {
        let resize = |limiter: FixedWindowLimiter| {
            FixedWindowLimiter::with_capacity(limiter.kind, limiter.policy, max_tracked_keys)
        };
        Self {
            general: resize(self.general),
            auth: resize(self.auth),
            password_reset: resize(self.password_reset),
            whitelist: self.whitelist,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let window = Duration::from_millis(config.email_rate_limit_window_ms);
        Self::new(
            RateLimitPolicy::new(config.email_rate_limit_general, window),
            RateLimitPolicy::new(config.email_rate_limit_auth, window),
            RateLimitPolicy::new(
                config.email_rate_limit_password_reset,
                Duration::from_millis(config.email_rate_limit_password_reset_window_ms),
            ),
            Whitelist::from_lists(&config.whitelist_ips(), &config.whitelist_api_keys()),
        )
        .with_max_tracked_keys(config.email_rate_limit_max_tracked_keys)
    }

    /// Limiter for a form type; unknown types use the general limiter.
    pub fn select(&self, form_type: &str) -> &FixedWindowLimiter {
        self.limiter(LimiterKind::classify(form_type))
    }

    pub fn limiter(&self, kind: LimiterKind) -> &FixedWindowLimiter {
        match kind {
            LimiterKind::General => &self.general,
            LimiterKind::Auth => &self.auth,
            LimiterKind::PasswordReset => &self.password_reset,
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        [&self.general, &self.auth, &self.password_reset]
            .iter()
            .map(|limiter| limiter.sweep_at(now))
            .sum()
    }

    /// Periodically drop expired windows. Ends once the limiters are dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiters: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(limiters) = limiters.upgrade() else {
                    break;
                };
                let removed = limiters.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "expired rate limit windows swept");
                }
            }
        })
    }
}

/// Counter key: `sha256(apiKey):ip`.
///
/// The key is not yet authenticated here, so only its digest is stored and
/// malformed values count as `anonymous`.
pub fn rate_limit_key(api_key: Option<&str>, ip: Option<IpAddr>) -> String {
    let ip = ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
    match api_key.filter(|key| is_well_formed(key)) {
        Some(key) => format!("{}:{}", hash_api_key(key), ip),
        None => format!("anonymous:{ip}"),
    }
}

/// Client IP from the socket, or from `X-Forwarded-For` behind a trusted proxy.
pub fn client_ip(request: &Request, trust_proxy_headers: bool) -> Option<IpAddr> {
    if trust_proxy_headers {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

#[derive(Deserialize)]
struct FormTypeField {
    #[serde(rename = "formType")]
    form_type: Option<String>,
}

fn form_type_hint(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<FormTypeField>(body)
        .ok()
        .and_then(|field| field.form_type)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Email rate limiting middleware.
///
/// # Flow
///
/// 1. Buffer the body and read `formType` (missing ⇒ general limiter)
/// 2. Skip entirely for whitelisted IPs or keys
/// 3. Count the request under `apiKey:ip`
/// 4. Over quota: 429 with `Retry-After`, the handler never runs
pub async fn email_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&request, state.settings.trust_proxy_headers);
    let api_key = header_str(request.headers(), API_KEY_HEADER).map(str::to_owned);

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| AppError::InvalidRequest("Request body is too large".to_string()))?;
    let form_type = form_type_hint(&bytes);
    let request = Request::from_parts(parts, Body::from(bytes));

    if state.limiters.whitelist().bypasses(ip, api_key.as_deref()) {
        tracing::debug!(?ip, "rate limit bypassed by whitelist");
        return Ok(next.run(request).await);
    }

    let limiter = state.limiters.select(form_type.as_deref().unwrap_or_default());
    match limiter.check(&rate_limit_key(api_key.as_deref(), ip)) {
        Decision::Rejected { retry_after_secs } => {
            tracing::warn!(
                limiter = limiter.kind().as_str(),
                ?ip,
                form_type = form_type.as_deref().unwrap_or_default(),
                retry_after_secs,
                "email rate limit exceeded"
            );
            Err(AppError::RateLimited { retry_after_secs })
        }
        Decision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(
                RATE_LIMIT_LIMIT,
                HeaderValue::from(limiter.policy().max_requests),
            );
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
            Ok(response)
        }
    }
}
