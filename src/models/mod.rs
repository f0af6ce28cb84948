//! Data models representing database entities and API bodies.

/// API key authentication model
pub mod api_key;
/// Form types, templates and email request bodies
pub mod email;
