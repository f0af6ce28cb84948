//! Email API - Main Application Entry Point
//!
//! REST service that lets sibling subdomains send templated email with an API
//! key. Keys are verified against SHA-256 hashes, sends are rate limited per
//! form type, and every query goes through one managed connection pool.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx, behind `PoolManager`
//! - **Authentication**: `x-api-key` verified against stored SHA-256 hashes
//! - **Delivery**: HTTP relay (or log-only when no relay is configured)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Initialize the connection pool and start its usage monitor
//! 3. Run database migrations
//! 4. Build the rate limiters, stores and email transport
//! 5. Start the server; on Ctrl+C drain requests and close the pool

use std::{net::SocketAddr, sync::Arc, time::Duration};

use molo_email_api::{
    config::Config,
    db::{PoolManager, PoolSettings},
    middleware::rate_limit::EmailLimiters,
    router::build_router,
    services::transport,
    state::{ApiSettings, AppState},
    store::postgres::PgStore,
};
use tracing_subscriber::EnvFilter;

/// How often expired rate-limit windows are dropped.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG (defaults to "info")
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = Arc::new(PoolManager::new(PoolSettings::from_config(&config)));
    pool.initialize().await?;
    pool.spawn_monitor(
        Duration::from_secs(config.db_monitor_interval_secs),
        config.db_high_water_percent,
    );

    pool.run_migrations().await?;
    tracing::info!("Database migrations complete");

    let limiters = Arc::new(EmailLimiters::from_config(&config));
    let sweeper = limiters.spawn_sweeper(LIMITER_SWEEP_INTERVAL);

    let store = Arc::new(PgStore::new(Arc::clone(&pool)));
    let transport = transport::from_config(&config)?;
    tracing::info!(transport = transport.name(), "Email transport ready");

    let state = AppState {
        pool: Arc::clone(&pool),
        api_keys: store.clone(),
        emails: store,
        transport,
        limiters,
        settings: Arc::new(ApiSettings::from_config(&config)),
    };
    if state.settings.admin_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN is not set; admin endpoints will reject every request");
    }

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Connect info feeds the rate limiter's per-IP keys
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    pool.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
