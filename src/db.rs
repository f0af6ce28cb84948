//! Database connection pool management.
//!
//! [`PoolManager`] owns the process-wide PostgreSQL pool. It is constructed
//! explicitly (no global singleton) and shared through `Arc`, so tests can
//! build isolated instances. Every helper acquires exactly one connection and
//! releases it when the helper returns; failures are logged with the
//! truncated query text and elapsed time, then handed back to the caller.

use std::{
    str::FromStr,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx::{
    Connection, PgConnection, Pool, Postgres,
    pool::PoolConnection,
    postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow},
    query::Query,
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use uuid::Uuid;

use crate::config::Config;

/// Type alias for PostgreSQL connection pool.
pub type DbPool = Pool<Postgres>;

/// Query text longer than this is cut before it is logged.
const MAX_LOGGED_QUERY_CHARS: usize = 120;

/// Errors raised by the pool layer.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,

    #[error("database pool is not initialized")]
    NotInitialized,

    #[error("timed out waiting for a database connection")]
    AcquireTimeout,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => PoolError::AcquireTimeout,
            other => PoolError::Database(other),
        }
    }
}

impl PoolError {
    /// True when the underlying database reported a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            PoolError::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a caller may wait for a free connection.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    /// Server-side `statement_timeout` applied to every connection.
    pub statement_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_url: config.database_url.clone(),
            max_connections: config.db_max_connections,
            min_connections: config.db_min_connections,
            acquire_timeout: Duration::from_millis(config.db_connect_timeout_ms),
            idle_timeout: Duration::from_millis(config.db_idle_timeout_ms),
            statement_timeout: Duration::from_millis(config.db_statement_timeout_ms),
        }
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub total: u32,
    pub idle: u32,
    pub active: u32,
    pub waiting: u32,
    pub max: u32,
}

impl ConnectionStats {
    /// Share of `max` currently checked out, in whole percent.
    pub fn utilization_percent(&self) -> u32 {
        if self.max == 0 {
            return 0;
        }
        ((u64::from(self.active) * 100) / u64::from(self.max)) as u32
    }

    pub fn exceeds_high_water(&self, percent: u32) -> bool {
        self.max > 0 && u64::from(self.active) * 100 >= u64::from(self.max) * u64::from(percent)
    }
}

/// A positional bind parameter for [`PoolManager::execute_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Bool(bool),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    /// SQL `NULL` carrying the column type, so Postgres can resolve operators.
    Null(SqlType),
}

/// Parameter type of a [`SqlParam::Null`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Int,
    Bool,
    Uuid,
    Timestamp,
}

impl SqlParam {
    fn bind_to<'q>(
        &'q self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            SqlParam::Text(value) => query.bind(value.as_str()),
            SqlParam::Int(value) => query.bind(*value),
            SqlParam::Bool(value) => query.bind(*value),
            SqlParam::Uuid(value) => query.bind(*value),
            SqlParam::Timestamp(value) => query.bind(*value),
            SqlParam::Null(SqlType::Text) => query.bind(None::<String>),
            SqlParam::Null(SqlType::Int) => query.bind(None::<i64>),
            SqlParam::Null(SqlType::Bool) => query.bind(None::<bool>),
            SqlParam::Null(SqlType::Uuid) => query.bind(None::<Uuid>),
            SqlParam::Null(SqlType::Timestamp) => query.bind(None::<DateTime<Utc>>),
        }
    }
}

/// Owner of the shared connection pool.
#[derive(Debug)]
pub struct PoolManager {
    settings: PoolSettings,
    pool: RwLock<Option<DbPool>>,
    /// Serializes `initialize` so concurrent callers open one pool.
    init_lock: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Counts a caller as waiting for a connection until dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PoolManager {
    /// Create an uninitialized manager. No connection is opened until [`initialize`](Self::initialize).
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
            monitor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_initialized(&self) -> bool {
        self.pool.read().is_some()
    }

    /// Open the pool.
    ///
    /// # Errors
    ///
    /// - `MissingDatabaseUrl` when no connection string is configured
    /// - `Database` when the server cannot be reached or rejects the login
    ///
    /// On failure nothing is retained, so calling `initialize` again is safe.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let _init = self.init_lock.lock().await;
        if self.is_initialized() {
            tracing::debug!("database pool already initialized");
            return Ok(());
        }

        let url = self
            .settings
            .database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(PoolError::MissingDatabaseUrl)?;

        let connect_options = PgConnectOptions::from_str(url)?.options([(
            "statement_timeout",
            self.settings.statement_timeout.as_millis().to_string(),
        )]);

        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .min_connections(self.settings.min_connections)
            .acquire_timeout(self.settings.acquire_timeout)
            .idle_timeout(self.settings.idle_timeout)
            .connect_with(connect_options)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "failed to initialize database pool"))?;

        *self.pool.write() = Some(pool);
        tracing::info!(
            max_connections = self.settings.max_connections,
            acquire_timeout_ms = self.settings.acquire_timeout.as_millis() as u64,
            "database pool initialized"
        );
        Ok(())
    }

    /// Stop the usage monitor and close every connection.
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!("database pool closed");
        }
    }

    /// Run the SQL migrations in `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), PoolError> {
        let pool = self.pool()?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(())
    }

    fn pool(&self) -> Result<DbPool, PoolError> {
        self.pool.read().clone().ok_or(PoolError::NotInitialized)
    }

    async fn acquire(&self, pool: &DbPool) -> Result<PoolConnection<Postgres>, PoolError> {
        let _waiting = WaitingGuard::enter(&self.waiting);
        pool.acquire().await.map_err(PoolError::from)
    }

    /// Run `sql` with positional parameters and return every row.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<PgRow>, PoolError> {
        let owned_sql = sql.to_owned();
        let params = params.to_vec();
        self.with_connection(sql, move |conn| {
            Box::pin(async move {
                let mut query = sqlx::query(&owned_sql);
                for param in &params {
                    query = param.bind_to(query);
                }
                query.fetch_all(&mut *conn).await
            })
        })
        .await
    }

    /// Borrow one connection for the duration of `f`.
    ///
    /// `label` is the query text (or a short description) used in logs.
    pub async fn with_connection<T, F>(&self, label: &str, f: F) -> Result<T, PoolError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let started = Instant::now();
        let result = async {
            let pool = self.pool()?;
            let mut conn = self.acquire(&pool).await?;
            let value = f(&mut *conn).await?;
            Ok::<T, PoolError>(value)
        }
        .await;
        observe(label, started, result)
    }

    /// Run `f` inside `BEGIN`/`COMMIT` on a single connection.
    ///
    /// Any error from `f` triggers a `ROLLBACK` before the error is returned.
    pub async fn transaction<T, F>(&self, label: &str, f: F) -> Result<T, PoolError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let started = Instant::now();
        let result = async {
            let pool = self.pool()?;
            let mut conn = self.acquire(&pool).await?;
            let mut tx = conn.begin().await?;

            match f(&mut *tx).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok::<T, PoolError>(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::error!(
                            query = %truncate_query(label),
                            error = %rollback_err,
                            "rollback failed"
                        );
                    }
                    Err(PoolError::from(err))
                }
            }
        }
        .await;
        observe(label, started, result)
    }

    /// Current pool usage. All zeros before initialization.
    pub fn connection_stats(&self) -> ConnectionStats {
        let waiting = self.waiting.load(Ordering::SeqCst) as u32;
        let max = self.settings.max_connections;
        match self.pool.read().as_ref() {
            Some(pool) => {
                let total = pool.size();
                let idle = pool.num_idle() as u32;
                ConnectionStats {
                    total,
                    idle,
                    active: total.saturating_sub(idle),
                    waiting,
                    max,
                }
            }
            None => ConnectionStats {
                waiting,
                max,
                ..ConnectionStats::default()
            },
        }
    }

    /// Round-trip `SELECT 1`. Never errors; failure reads as `false`.
    pub async fn health_check(&self) -> bool {
        self.with_connection("SELECT 1", |conn| {
            Box::pin(async move { sqlx::query("SELECT 1").execute(&mut *conn).await.map(|_| ()) })
        })
        .await
        .is_ok()
    }

    /// Periodically sample [`connection_stats`](Self::connection_stats) and warn above `high_water_percent`.
    ///
    /// The task holds only a weak reference and ends once the manager is dropped.
    pub fn spawn_monitor(self: &Arc<Self>, every: Duration, high_water_percent: u32) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let stats = manager.connection_stats();
                if stats.exceeds_high_water(high_water_percent) {
                    tracing::warn!(
                        active = stats.active,
                        idle = stats.idle,
                        waiting = stats.waiting,
                        max = stats.max,
                        utilization = stats.utilization_percent(),
                        "database pool above high-water mark"
                    );
                } else {
                    tracing::debug!(
                        active = stats.active,
                        idle = stats.idle,
                        waiting = stats.waiting,
                        "database pool usage"
                    );
                }
            }
        });

        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }
}

fn observe<T>(label: &str, started: Instant, result: Result<T, PoolError>) -> Result<T, PoolError> {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(query = %truncate_query(label), elapsed_ms, "query completed"),
        Err(err) => tracing::error!(
            query = %truncate_query(label),
            elapsed_ms,
            error = %err,
            "query failed"
        ),
    }
    result
}

/// Collapse whitespace and cut the query text for logging.
pub fn truncate_query(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_LOGGED_QUERY_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(MAX_LOGGED_QUERY_CHARS).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_without_url_fails_and_keeps_pool_unset() {
        let manager = PoolManager::new(PoolSettings::default());

        let err = manager.initialize().await.unwrap_err();

        assert!(matches!(err, PoolError::MissingDatabaseUrl));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn blank_url_is_treated_as_missing() {
        let manager = PoolManager::new(PoolSettings {
            database_url: Some("   ".to_string()),
            ..PoolSettings::default()
        });

        assert!(matches!(
            manager.initialize().await,
            Err(PoolError::MissingDatabaseUrl)
        ));
    }

    #[tokio::test]
    async fn queries_before_initialize_report_not_initialized() {
        let manager = PoolManager::new(PoolSettings::default());

        let err = manager
            .execute_query("SELECT $1::int", &[SqlParam::Int(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotInitialized));

        let err = manager
            .transaction("noop", |_conn| Box::pin(async move { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotInitialized));

        assert!(!manager.health_check().await);
    }

    #[tokio::test]
    async fn concurrent_initialize_calls_are_serialized() {
        let manager = Arc::new(PoolManager::new(PoolSettings::default()));

        let guard = manager.init_lock.lock().await;
        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.initialize().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        drop(guard);
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(PoolError::MissingDatabaseUrl)));
    }

    #[test]
    fn nulls_keep_their_column_type() {
        let params = [
            SqlParam::Null(SqlType::Uuid),
            SqlParam::Null(SqlType::Timestamp),
        ];
        assert_ne!(params[0], params[1]);
        assert_ne!(params[0], SqlParam::Null(SqlType::Text));
    }

    #[test]
    fn stats_before_initialize_are_empty() {
        let manager = PoolManager::new(PoolSettings {
            max_connections: 7,
            ..PoolSettings::default()
        });

        let stats = manager.connection_stats();
        assert_eq!(
            stats,
            ConnectionStats {
                max: 7,
                ..ConnectionStats::default()
            }
        );
    }

    #[test]
    fn high_water_mark_uses_active_share_of_max() {
        let stats = ConnectionStats {
            total: 10,
            idle: 2,
            active: 8,
            waiting: 0,
            max: 10,
        };
        assert_eq!(stats.utilization_percent(), 80);
        assert!(stats.exceeds_high_water(80));
        assert!(!stats.exceeds_high_water(81));

        let empty = ConnectionStats::default();
        assert!(!empty.exceeds_high_water(80));
        assert_eq!(empty.utilization_percent(), 0);
    }

    #[test]
    fn pool_timeout_maps_to_acquire_timeout() {
        assert!(matches!(
            PoolError::from(sqlx::Error::PoolTimedOut),
            PoolError::AcquireTimeout
        ));
        assert!(matches!(
            PoolError::from(sqlx::Error::RowNotFound),
            PoolError::Database(_)
        ));
    }

    #[test]
    fn long_queries_are_truncated_for_logs() {
        let short = "SELECT  1\n FROM   dual";
        assert_eq!(truncate_query(short), "SELECT 1 FROM dual");

        let long = format!("SELECT {}", "x, ".repeat(100));
        let logged = truncate_query(&long);
        assert!(logged.ends_with("..."));
        assert_eq!(logged.chars().count(), MAX_LOGGED_QUERY_CHARS + 3);
    }
}
