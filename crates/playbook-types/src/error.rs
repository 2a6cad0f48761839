//! Error types shared by the typed model.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while mapping generic records onto the logical model.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown state '{value}' for {kind}")]
    UnknownState { kind: String, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
