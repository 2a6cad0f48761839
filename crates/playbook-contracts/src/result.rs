//! Validation outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ContractError, SCHEMA_ERROR, VALIDATION_ERROR};

/// One problem found while validating data against a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    /// JSON pointer into the data, empty for the root.
    #[serde(default)]
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(VALIDATION_ERROR, "", message)
    }

    pub fn business_rule(path: &str, rule: &str, message: impl Into<String>) -> Self {
        Self::new("BUSINESS_RULE_VIOLATION", path, format!("{rule}: {}", message.into()))
    }

    pub fn smart_code(path: &str, code: &str) -> Self {
        Self::new(
            "INVALID_SMART_CODE",
            path,
            format!("'{code}' is not a valid smart code"),
        )
    }
}

impl From<&ContractError> for ValidationIssue {
    fn from(err: &ContractError) -> Self {
        Self::new(err.code(), "", err.to_string())
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {}: {}", self.code, self.path, self.message)
        }
    }
}

/// Timings for one validation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationPerformance {
    pub validation_time_ms: f64,
    /// Time spent fetching and compiling the contract; near zero on a cache hit.
    pub schema_load_time_ms: f64,
}

/// Outcome of validating one payload against one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    /// The normalized data, present only when valid.
    pub validated_data: Option<Value>,
    pub performance: ValidationPerformance,
}

impl ValidationResult {
    pub fn passed(data: Value, performance: ValidationPerformance) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            validated_data: Some(data),
            performance,
        }
    }

    pub fn failed(errors: Vec<ValidationIssue>, performance: ValidationPerformance) -> Self {
        Self {
            valid: false,
            errors,
            validated_data: None,
            performance,
        }
    }

    /// Failure carrying a single error derived from `err`.
    pub fn from_error(err: &ContractError) -> Self {
        Self::failed(vec![err.into()], ValidationPerformance::default())
    }

    /// Whether any error stems from a broken contract rather than bad data.
    pub fn has_schema_error(&self) -> bool {
        self.errors.iter().any(|e| e.code == SCHEMA_ERROR)
    }

    /// Error messages, formatted for run and step records.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}
