//! HTTP middleware components.
//!
//! Middleware run before route handlers and may short-circuit the request.
//! On the email routes the rate limiter runs first, then authentication.

/// API key and admin token authentication
pub mod auth;
/// Form-type based rate limiting
pub mod rate_limit;
