//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, etc.)
//! 2. Delegates to a service or store
//! 3. Returns HTTP response (JSON, status code)

/// API key administration endpoints
pub mod admin;
/// Email send/notify/form-type endpoints
pub mod email;
/// Liveness endpoints
pub mod health;
