//! Error types for the outbound rate limiter.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A regex rule whose pattern does not compile
    #[error("Rule '{rule}' has an invalid regex: {source}")]
    InvalidRegex {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// A rule that fails validation for any other reason
    #[error("Rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Adding a rule whose description or match string is already in use
    #[error("Rule '{0}' already exists")]
    RuleExists(String),

    /// No rule has the given description
    #[error("Rule '{0}' does not exist")]
    RuleNotFound(String),

    /// The wait before a request was interrupted; the request is aborted
    #[error("Throttle wait was interrupted")]
    Interrupted,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
