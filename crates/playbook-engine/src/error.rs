use playbook_ai::AiError;
use playbook_config::ConfigError;
use playbook_contracts::ContractError;
use playbook_store::StoreError;
use playbook_types::EntityKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Cannot move {kind} {entity_id} from '{from}' to '{to}': {reason}")]
    TransitionNotAllowed {
        kind: EntityKind,
        entity_id: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("{0}")]
    ContractViolation(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Invalid playbook definition: {0}")]
    InvalidDefinition(String),

    #[error("Orchestrator setup error: {0}")]
    Setup(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Worker error [{code}]: {message}")]
    Worker { code: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("AI backend error: {0}")]
    Ai(#[from] AiError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model error: {0}")]
    Model(#[from] playbook_types::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn worker(code: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Worker {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Stable code recorded on failed steps.
    pub fn code(&self) -> String {
        match self {
            EngineError::TransitionNotAllowed { .. } => "TRANSITION_NOT_ALLOWED".into(),
            EngineError::ContractViolation(_) => "CONTRACT_VIOLATION".into(),
            EngineError::PolicyViolation(_) => "POLICY_VIOLATION".into(),
            EngineError::InvalidDefinition(_) => "INVALID_DEFINITION".into(),
            EngineError::Setup(_) => "SETUP_ERROR".into(),
            EngineError::InvalidRequest(_) => "INVALID_REQUEST".into(),
            EngineError::Worker { code, .. } => code.clone(),
            EngineError::Store(_) => "STORE_ERROR".into(),
            EngineError::Contract(e) => e.code().into(),
            EngineError::Ai(e) => e.code().into(),
            EngineError::Config(_) => "CONFIG_ERROR".into(),
            EngineError::Model(_) | EngineError::Json(_) => "DATA_ERROR".into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_not_found(),
            EngineError::Model(playbook_types::Error::NotFound(_)) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
