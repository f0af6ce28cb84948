//! HTTP route table.

use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, RETRY_AFTER},
    },
    middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers,
    middleware::{
        auth::{API_KEY_HEADER, SUBDOMAIN_HEADER, admin_middleware, auth_middleware},
        rate_limit::{RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, email_rate_limit},
    },
    state::AppState,
};

/// Build the application router.
///
/// Layout:
/// - `/health`, `/api/email/health`: public
/// - `/api/email/send`, `/api/email/notify-submission`: rate limit, then API key auth
/// - `/api/email/form-types`: API key auth
/// - `/admin/*`: admin bearer token
pub fn build_router(state: AppState) -> Router {
    // route_layer: the layer added last runs first, so the limiter sees
    // requests before authentication does.
    let email_routes = Router::new()
        .route("/api/email/send", post(handlers::email::send_email))
        .route(
            "/api/email/notify-submission",
            post(handlers::email::notify_submission),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            email_rate_limit,
        ));

    let catalogue_routes = Router::new()
        .route(
            "/api/email/form-types",
            get(handlers::email::list_form_types),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let admin_routes = Router::new()
        .route(
            "/admin/api-keys",
            get(handlers::admin::list_api_keys).post(handlers::admin::create_api_key),
        )
        .route(
            "/admin/api-keys/migrate",
            post(handlers::admin::migrate_api_keys),
        )
        .route(
            "/admin/api-keys/{id}",
            get(handlers::admin::get_api_key)
                .patch(handlers::admin::update_api_key)
                .delete(handlers::admin::delete_api_key),
        )
        .route("/admin/pool-stats", get(handlers::admin::pool_stats))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ));

    Router::new()
        // Public routes (no authentication required)
        .route("/health", get(handlers::health::health_check))
        .route("/api/email/health", get(handlers::health::email_health))
        .merge(email_routes)
        .merge(catalogue_routes)
        .merge(admin_routes)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            HeaderName::from_static(API_KEY_HEADER),
            HeaderName::from_static(SUBDOMAIN_HEADER),
            CONTENT_TYPE,
            AUTHORIZATION,
        ])
        .expose_headers([
            RETRY_AFTER,
            HeaderName::from_static(RATE_LIMIT_LIMIT),
            HeaderName::from_static(RATE_LIMIT_REMAINING),
        ])
}
