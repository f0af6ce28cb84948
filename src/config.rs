//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment variables into a type-safe struct.

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// Field names map to upper-case variables, e.g. `email_rate_limit_general`
/// is read from `EMAIL_RATE_LIMIT_GENERAL`.
///
/// - `DATABASE_URL`: PostgreSQL connection string (the pool refuses to start without it)
/// - `SERVER_PORT`: HTTP server port, defaults to 3000
/// - `DB_*`: connection pool sizing and timeouts
/// - `EMAIL_RATE_LIMIT_*`: per-policy quotas, windows and whitelists
/// - `EMAIL_RELAY_*`: outbound email relay endpoint and credentials
/// - `ADMIN_API_TOKEN`: bearer token for the key management endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_port")]
    pub server_port: u16,

    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub db_connect_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub db_idle_timeout_ms: u64,

    #[serde(default = "default_statement_timeout_ms")]
    pub db_statement_timeout_ms: u64,

    #[serde(default = "default_monitor_interval_secs")]
    pub db_monitor_interval_secs: u64,

    #[serde(default = "default_high_water_percent")]
    pub db_high_water_percent: u32,

    #[serde(default = "default_general_limit")]
    pub email_rate_limit_general: u32,

    #[serde(default = "default_auth_limit")]
    pub email_rate_limit_auth: u32,

    #[serde(default = "default_password_reset_limit")]
    pub email_rate_limit_password_reset: u32,

    #[serde(default = "default_window_ms")]
    pub email_rate_limit_window_ms: u64,

    #[serde(default = "default_password_reset_window_ms")]
    pub email_rate_limit_password_reset_window_ms: u64,

    /// Upper bound on counters each limiter keeps in memory.
    #[serde(default = "default_max_tracked_keys")]
    pub email_rate_limit_max_tracked_keys: usize,

    /// Comma-separated list of client IPs exempt from rate limiting.
    #[serde(default)]
    pub email_rate_limit_whitelist_ips: Vec<String>,

    /// Comma-separated list of API keys exempt from rate limiting.
    #[serde(default)]
    pub email_rate_limit_whitelist_api_keys: Vec<String>,

    /// Take the client IP from `X-Forwarded-For` (only behind a trusted proxy).
    #[serde(default)]
    pub trust_proxy_headers: bool,

    #[serde(default)]
    pub email_relay_url: Option<String>,

    #[serde(default)]
    pub email_relay_token: Option<String>,

    #[serde(default)]
    pub email_relay_secret: Option<String>,

    #[serde(default = "default_from_address")]
    pub email_from_address: String,

    #[serde(default)]
    pub email_notify_address: Option<String>,

    #[serde(default)]
    pub admin_api_token: Option<String>,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_high_water_percent() -> u32 {
    80
}

fn default_general_limit() -> u32 {
    10
}

fn default_auth_limit() -> u32 {
    5
}

fn default_password_reset_limit() -> u32 {
    3
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_password_reset_window_ms() -> u64 {
    900_000
}

fn default_max_tracked_keys() -> usize {
    10_000
}

fn default_from_address() -> String {
    "no-reply@localhost".to_string()
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// This method first attempts to load a `.env` file (which is optional),
    /// then reads environment variables and deserializes them into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Environment variable values cannot be parsed into expected types
    /// - A quota, window or pool bound is out of range
    pub fn from_env() -> Result<Self, ConfigError> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        let config = envy::from_env::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from explicit key/value pairs instead of the process environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::from_iter::<_, Config>(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let quotas = [
            ("EMAIL_RATE_LIMIT_GENERAL", self.email_rate_limit_general),
            ("EMAIL_RATE_LIMIT_AUTH", self.email_rate_limit_auth),
            (
                "EMAIL_RATE_LIMIT_PASSWORD_RESET",
                self.email_rate_limit_password_reset,
            ),
        ];
        for (name, value) in quotas {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }

        // Retry-After is whole seconds; partial-second windows would overstate it.
        let windows = [
            ("EMAIL_RATE_LIMIT_WINDOW_MS", self.email_rate_limit_window_ms),
            (
                "EMAIL_RATE_LIMIT_PASSWORD_RESET_WINDOW_MS",
                self.email_rate_limit_password_reset_window_ms,
            ),
        ];
        for (name, value) in windows {
            if value == 0 || value % 1000 != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a positive whole number of seconds (multiple of 1000)"
                )));
            }
        }

        if self.email_rate_limit_max_tracked_keys == 0 {
            return Err(ConfigError::Invalid(
                "EMAIL_RATE_LIMIT_MAX_TRACKED_KEYS must be greater than 0".to_string(),
            ));
        }

        if self.db_max_connections == 0 || self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::Invalid(
                "DB_MAX_CONNECTIONS must be positive and not below DB_MIN_CONNECTIONS".to_string(),
            ));
        }

        if !(1..=100).contains(&self.db_high_water_percent) {
            return Err(ConfigError::Invalid(
                "DB_HIGH_WATER_PERCENT must be between 1 and 100".to_string(),
            ));
        }

        Ok(())
    }

    /// Whitelisted IPs with blank entries removed.
    pub fn whitelist_ips(&self) -> Vec<String> {
        non_blank(&self.email_rate_limit_whitelist_ips)
    }

    /// Whitelisted API keys with blank entries removed.
    pub fn whitelist_api_keys(&self) -> Vec<String> {
        non_blank(&self.email_rate_limit_whitelist_api_keys)
    }
}

fn non_blank(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_vars(vars(&[])).unwrap();

        assert_eq!(config.database_url, None);
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.db_max_connections, 20);
        assert_eq!(config.email_rate_limit_general, 10);
        assert_eq!(config.email_rate_limit_auth, 5);
        assert_eq!(config.email_rate_limit_password_reset, 3);
        assert_eq!(config.email_rate_limit_window_ms, 60_000);
        assert_eq!(config.email_rate_limit_password_reset_window_ms, 900_000);
        assert_eq!(config.email_rate_limit_max_tracked_keys, 10_000);
        assert!(config.whitelist_ips().is_empty());
        assert!(!config.trust_proxy_headers);
    }

    #[test]
    fn overrides_and_lists_are_parsed() {
        let config = Config::from_vars(vars(&[
            ("DATABASE_URL", "postgres://localhost/email"),
            ("EMAIL_RATE_LIMIT_GENERAL", "25"),
            ("EMAIL_RATE_LIMIT_WINDOW_MS", "1000"),
            ("EMAIL_RATE_LIMIT_WHITELIST_IPS", "10.0.0.1, 10.0.0.2"),
            ("EMAIL_RATE_LIMIT_WHITELIST_API_KEYS", "molo_abc"),
        ]))
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/email")
        );
        assert_eq!(config.email_rate_limit_general, 25);
        assert_eq!(config.email_rate_limit_window_ms, 1000);
        assert_eq!(config.whitelist_ips(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.whitelist_api_keys(), vec!["molo_abc"]);
    }

    #[test]
    fn zero_quota_is_rejected() {
        let err = Config::from_vars(vars(&[("EMAIL_RATE_LIMIT_AUTH", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn partial_second_windows_are_rejected() {
        for (name, value) in [
            ("EMAIL_RATE_LIMIT_WINDOW_MS", "1500"),
            ("EMAIL_RATE_LIMIT_PASSWORD_RESET_WINDOW_MS", "999"),
            ("EMAIL_RATE_LIMIT_WINDOW_MS", "0"),
        ] {
            let err = Config::from_vars(vars(&[(name, value)])).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{name}={value}");
        }

        let config = Config::from_vars(vars(&[("EMAIL_RATE_LIMIT_WINDOW_MS", "2000")])).unwrap();
        assert_eq!(config.email_rate_limit_window_ms, 2000);
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = Config::from_vars(vars(&[("SERVER_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
    }
}
