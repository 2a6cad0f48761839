use playbook_store::StoreError;
use thiserror::Error;

/// Machine-readable code for a missing mandatory contract.
pub const CONTRACT_NOT_FOUND: &str = "CONTRACT_NOT_FOUND";
/// Machine-readable code for data that fails its contract.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Machine-readable code for a contract that cannot be compiled.
pub const SCHEMA_ERROR: &str = "SCHEMA_ERROR";

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("No {field} contract found for {entity_id}")]
    NotFound { entity_id: String, field: String },

    #[error("Malformed contract: {0}")]
    Schema(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Contract lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl ContractError {
    /// Stable code surfaced in validation results.
    pub fn code(&self) -> &'static str {
        match self {
            ContractError::NotFound { .. } => CONTRACT_NOT_FOUND,
            ContractError::Schema(_) => SCHEMA_ERROR,
            ContractError::Validation(_) | ContractError::Store(_) => VALIDATION_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContractError>;
