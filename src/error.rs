//! Error types for the Turnstile rate limiter.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// A key mode could not be parsed from its textual or numeric form
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// The policy keys by principal but the request carries none
    #[error("Request has no authenticated principal")]
    MissingPrincipal,

    /// The counter store failed or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// No policy is registered under the requested name
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
