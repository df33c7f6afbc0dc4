//! Error types for the Engram domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Engram operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Input validation ---
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        /// Which input field failed validation, if known.
        field: Option<&'static str>,
    },

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Storage errors ---
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Reflection errors ---
    #[error("Reflection error: {0}")]
    Reflection(#[from] ReflectionError),

    // --- Recall budget ---
    #[error("Token budget exceeded: need {required} tokens but budget is {budget}")]
    TokenBudgetExceeded { budget: usize, required: usize },

    // --- Lookup misses ---
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Turn not found: {0}")]
    TurnNotFound(String),
}

impl Error {
    /// Build a validation error for a named input field.
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field),
        }
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Backend not initialized")]
    NotInitialized,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization failure: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("All {attempts} retry attempts exhausted: {message}")]
    RetryExhausted { attempts: u32, message: String },
}

impl ProviderError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Connection trouble, timeouts, rate limits, and server-side errors are
    /// retryable; authentication and malformed-response errors are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Api { status_code, .. } => {
                *status_code == 408 || *status_code == 429 || *status_code >= 500
            }
            Self::AuthenticationFailed(_)
            | Self::InvalidResponse(_)
            | Self::NotConfigured(_)
            | Self::RetryExhausted { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReflectionError {
    #[error("Reflection failed for episode {episode_id}: {message}")]
    Failed { episode_id: String, message: String },

    #[error("Reflection provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_displays_field_message() {
        let err = Error::validation("role", "unknown role: robot");
        assert!(err.to_string().contains("unknown role"));
        match err {
            Error::Validation { field, .. } => assert_eq!(field, Some("role")),
            other => panic!("Expected Validation, got: {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ProviderError::Api {
            status_code: 503,
            message: "Service Unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        let err = ProviderError::AuthenticationFailed("bad key".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_error_converts_to_top_level() {
        let err: Error = StorageError::Conflict("fact already superseded".into()).into();
        assert!(err.to_string().contains("already superseded"));
    }
}
