//! Signals accepted by the orchestrator and events it emits.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Id, Timestamp};

/// Kind of an external signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    /// A prerequisite changed; re-poll immediately.
    StepReady,
    TimeoutWarning,
    EscalationRequired,
    /// An outside system delivered a named signal for a step.
    ExternalUpdate,
    PauseRequested,
    ResumeRequested,
}

/// An asynchronous external event delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl Signal {
    pub fn new(signal_type: SignalType, payload: Value) -> Self {
        Self {
            signal_type,
            payload,
            timestamp: crate::now(),
        }
    }

    pub fn step_ready() -> Self {
        Self::new(SignalType::StepReady, Value::Null)
    }

    /// Record `signal` as received by `step_id`.
    pub fn external_update(step_id: &str, signal: &str) -> Self {
        Self::new(
            SignalType::ExternalUpdate,
            serde_json::json!({ "step_id": step_id, "signal": signal }),
        )
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Lifecycle notifications broadcast to monitoring consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "step:completed")]
    StepCompleted {
        step_id: Id,
        run_id: Id,
        outputs: Value,
    },
    #[serde(rename = "step:failed")]
    StepFailed {
        step_id: Id,
        run_id: Id,
        error: String,
        attempt: u32,
    },
    #[serde(rename = "run:completed")]
    RunCompleted { run_id: Id },
    #[serde(rename = "run:failed")]
    RunFailed { run_id: Id, reason: String },
}

impl EngineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::RunCompleted { run_id }
            | EngineEvent::RunFailed { run_id, .. } => run_id,
        }
    }
}
