//! Business logic services.
//!
//! Services contain the core logic separated from HTTP handlers: key hashing
//! and verification, template rendering and dispatch, and the outbound
//! email transport.

pub mod api_key_service;
pub mod email_service;
pub mod transport;
