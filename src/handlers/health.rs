//! Health check endpoints for service monitoring.

use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{db::ConnectionStats, services::transport::TransportHealth, state::AppState};

/// Health check response.
///
/// Returns service status, database connectivity and pool usage.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service status
    pub status: String,

    /// Database connection status
    pub database: String,

    pub pool: ConnectionStats,

    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
}

/// Health check handler.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "status": "healthy",
///   "database": "connected",
///   "pool": { "total": 2, "idle": 2, "active": 0, "waiting": 0, "max": 20 },
///   "timestamp": "2025-12-21T19:00:00Z"
/// }
/// ```
///
/// # Response (503 Service Unavailable)
///
/// Same body with `"status": "unhealthy"` when the database round trip fails.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.pool.health_check().await;

    let (status, label, database) = if healthy {
        (StatusCode::OK, "healthy", "connected")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "unreachable")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            database: database.to_string(),
            pool: state.pool.connection_stats(),
            timestamp: Utc::now(),
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct EmailHealthResponse {
    pub status: String,
    pub transport: String,
    pub connectivity: TransportHealth,
    pub timestamp: DateTime<Utc>,
}

/// Unauthenticated email transport check.
///
/// An unconfigured transport (messages are only logged) still reports 200.
pub async fn email_health(State(state): State<AppState>) -> (StatusCode, Json<EmailHealthResponse>) {
    let connectivity = state.transport.check().await;
    let (status, label) = match connectivity {
        TransportHealth::Connected => (StatusCode::OK, "healthy"),
        TransportHealth::Unconfigured => (StatusCode::OK, "degraded"),
        TransportHealth::Unreachable => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
    };

    (
        status,
        Json(EmailHealthResponse {
            status: label.to_string(),
            transport: state.transport.name().to_string(),
            connectivity,
            timestamp: Utc::now(),
        }),
    )
}
