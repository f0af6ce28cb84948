//! Cross-subdomain email API.
//!
//! Sibling sites call this service with an API key to send templated email
//! for a named form type. Keys are stored as SHA-256 hashes, requests are
//! rate limited per form type, and all database access goes through a single
//! managed connection pool.

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod router;
pub mod services;
pub mod state;
pub mod store;
