//! Error types for the AI crate.

use thiserror::Error;

/// Result type alias using the AI error type.
pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    /// Backend/API error from the provider.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Network/connectivity error (retryable).
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limit exceeded (retryable with backoff).
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Authentication failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error (API key missing, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The model answered but not with a usable JSON payload.
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

impl AiError {
    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }

    /// Stable code recorded on failed steps.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "AI_BACKEND_ERROR",
            Self::Network(_) => "AI_NETWORK_ERROR",
            Self::RateLimit(_) => "AI_RATE_LIMITED",
            Self::Auth(_) => "AI_AUTH_ERROR",
            Self::Config(_) => "AI_CONFIG_ERROR",
            Self::Serialization(_) => "AI_SERIALIZATION_ERROR",
            Self::InvalidResponse(_) => "AI_INVALID_RESPONSE",
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiError::Network(format!("Request timed out: {}", err))
        } else if err.is_connect() {
            AiError::Network(format!("Connection failed: {}", err))
        } else {
            AiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AiError {
    fn from(err: serde_json::Error) -> Self {
        AiError::Serialization(err.to_string())
    }
}
