// HTTP API surface
pub mod api;

// Configuration loading
pub mod config;

// Encrypted credential storage and the envelope codec
pub mod credentials;

// Error types
pub mod error;

// PKCE authorization flow and provider calls
pub mod oauth;

// Token refresh manager
pub mod tokens;

pub use error::Error;
