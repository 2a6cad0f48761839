//! Logical playbook model layered over generic records.
//!
//! Each typed view serializes into the owning record's metadata bag. Identity
//! columns (id, organization, parent links) always come from the record
//! itself, so a stale copy inside the metadata can never win.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::{EntityRecord, Metadata, TransactionLineRecord, TransactionRecord};
use crate::status::{EntityKind, PlaybookStatus, RunStatus, StepStatus};
use crate::worker::{Priority, StepType, WorkerType};
use crate::{Id, Timestamp};

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

/// Per-step retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: Vec<u64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> Vec<u64> {
    vec![5, 30, 120]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the next attempt. `attempt` is the 1-based count of
    /// attempts made so far; schedules shorter than that fall back to
    /// `fallback_secs`.
    pub fn backoff_for(&self, attempt: u32, fallback_secs: u64) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        let secs = self.backoff_seconds.get(idx).copied().unwrap_or(fallback_secs);
        Duration::from_secs(secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Definitions
// ─────────────────────────────────────────────────────────────────────────────

/// A reusable, versioned multi-step business process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    #[serde(default)]
    pub id: Id,
    #[serde(default)]
    pub organization_id: Id,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: PlaybookStatus,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub published_at: Option<Timestamp>,
    #[serde(default)]
    pub archived_at: Option<Timestamp>,
}

fn default_version() -> u32 {
    1
}

impl PlaybookDefinition {
    pub fn from_record(record: &EntityRecord) -> Result<Self> {
        let mut def: Self = decode(&record.metadata)?;
        def.id = record.id.clone();
        def.organization_id = record.organization_id.clone();
        def.code = record.entity_code.clone();
        def.name = record.entity_name.clone();
        Ok(def)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        encode(self)
    }
}

/// Model settings for an AI step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AiStepSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// One step of a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(default)]
    pub id: Id,
    #[serde(default)]
    pub playbook_id: Id,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 1-based position within the playbook.
    pub sequence: u32,
    pub worker_type: WorkerType,
    #[serde(default)]
    pub step_type: StepType,
    /// `None` uses the engine-wide retry defaults.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_sla_seconds")]
    pub sla_seconds: u64,
    /// Explicit predecessor sequences beyond the previous step.
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub required_signals: Vec<String>,
    /// A critical step exhausting its retries fails the whole run.
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub service_endpoint: Option<String>,
    #[serde(default)]
    pub input_overrides: Metadata,
    #[serde(default)]
    pub ai: Option<AiStepSettings>,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Delay after the run starts before the step may be dispatched.
    #[serde(default)]
    pub earliest_start_offset_secs: Option<u64>,
    /// Side effects a worker may report; `None` allows any.
    #[serde(default)]
    pub allowed_side_effects: Option<Vec<String>>,
}

fn default_sla_seconds() -> u64 {
    3600
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, sequence: u32, worker_type: WorkerType) -> Self {
        Self {
            id: Id::new(),
            playbook_id: Id::new(),
            name: name.into(),
            description: String::new(),
            sequence,
            worker_type,
            step_type: StepType::default(),
            retry_policy: None,
            sla_seconds: default_sla_seconds(),
            depends_on: Vec::new(),
            required_signals: Vec::new(),
            critical: false,
            priority: None,
            service_endpoint: None,
            input_overrides: Metadata::new(),
            ai: None,
            assignee: None,
            earliest_start_offset_secs: None,
            allowed_side_effects: None,
        }
    }

    pub fn from_record(record: &EntityRecord) -> Result<Self> {
        let mut def: Self = decode(&record.metadata)?;
        def.id = record.id.clone();
        if def.name.is_empty() {
            def.name = record.entity_name.clone();
        }
        Ok(def)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        encode(self)
    }

    pub fn sla(&self) -> Duration {
        Duration::from_secs(self.sla_seconds)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runs
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate step counts for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunProgress {
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    #[serde(default)]
    pub skipped_steps: u32,
}

impl RunProgress {
    /// Recompute counts from the current step states.
    pub fn from_steps(steps: &[StepExecution]) -> Self {
        let mut progress = RunProgress {
            total_steps: steps.len() as u32,
            ..Default::default()
        };
        for step in steps {
            match step.status {
                StepStatus::Completed => progress.completed_steps += 1,
                StepStatus::Failed => progress.failed_steps += 1,
                StepStatus::Skipped => progress.skipped_steps += 1,
                _ => {}
            }
        }
        progress
    }

    pub fn all_terminal(&self) -> bool {
        self.total_steps > 0
            && self.completed_steps + self.failed_steps + self.skipped_steps == self.total_steps
    }
}

/// One execution instance of a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookRun {
    #[serde(default)]
    pub id: Id,
    #[serde(default)]
    pub organization_id: Id,
    #[serde(default)]
    pub playbook_id: Id,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub progress: RunProgress,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub ai_insights: Vec<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub blocked_at: Option<Timestamp>,
    #[serde(default)]
    pub escalate_at: Option<Timestamp>,
}

impl PlaybookRun {
    pub fn from_record(record: &TransactionRecord) -> Result<Self> {
        let mut run: Self = decode(&record.metadata)?;
        run.id = record.id.clone();
        run.organization_id = record.organization_id.clone();
        run.playbook_id = record
            .reference_entity_id
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("run {} has no playbook", record.id)))?;
        Ok(run)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        encode(self)
    }
}

/// Structured failure attached to a step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl StepError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// One row per (run, step definition) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    #[serde(default)]
    pub id: Id,
    #[serde(default)]
    pub organization_id: Id,
    #[serde(default)]
    pub run_id: Id,
    #[serde(default)]
    pub step_id: Id,
    #[serde(default)]
    pub sequence: u32,
    #[serde(default)]
    pub name: String,
    pub worker_type: WorkerType,
    #[serde(default)]
    pub step_type: StepType,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default)]
    pub outputs: Option<Value>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub required_signals: Vec<String>,
    #[serde(default)]
    pub received_signals: Vec<String>,
    #[serde(default)]
    pub sla_seconds: u64,
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    #[serde(default)]
    pub due_at: Option<Timestamp>,
    #[serde(default)]
    pub retry_scheduled_at: Option<Timestamp>,
    #[serde(default)]
    pub earliest_start_time: Option<Timestamp>,
    #[serde(default)]
    pub paused_at: Option<Timestamp>,
    #[serde(default)]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub ai_insights: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub claimed_by: Option<String>,
}

impl StepExecution {
    /// Build the execution row for `def` inside `run`.
    pub fn from_definition(def: &StepDefinition, run: &PlaybookRun, status: StepStatus) -> Self {
        Self {
            id: crate::new_id(),
            organization_id: run.organization_id.clone(),
            run_id: run.id.clone(),
            step_id: def.id.clone(),
            sequence: def.sequence,
            name: def.name.clone(),
            worker_type: def.worker_type,
            step_type: def.step_type,
            status,
            attempt: 0,
            inputs: Value::Null,
            outputs: None,
            error: None,
            priority: def.priority.unwrap_or(run.priority),
            critical: def.critical,
            depends_on: def.depends_on.clone(),
            required_signals: def.required_signals.clone(),
            received_signals: Vec::new(),
            sla_seconds: def.sla_seconds,
            started_at: None,
            completed_at: None,
            due_at: None,
            retry_scheduled_at: None,
            earliest_start_time: def
                .earliest_start_offset_secs
                .and_then(|secs| crate::after_secs(run.started_at?, secs)),
            paused_at: None,
            ai_confidence: None,
            ai_insights: None,
            worker_id: None,
            assignee: def.assignee.clone(),
            latency_ms: None,
            claimed_by: None,
        }
    }

    pub fn from_record(record: &TransactionLineRecord) -> Result<Self> {
        let mut step: Self = decode(&record.metadata)?;
        step.id = record.id.clone();
        step.organization_id = record.organization_id.clone();
        step.run_id = record.transaction_id.clone();
        step.sequence = record.line_number;
        if let Some(ref step_id) = record.entity_id {
            step.step_id = step_id.clone();
        }
        Ok(step)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        encode(self)
    }

    /// Every required signal has been received.
    pub fn signals_satisfied(&self) -> bool {
        self.required_signals
            .iter()
            .all(|s| self.received_signals.contains(s))
    }

    /// The key this step's outputs are exposed under to later steps.
    pub fn output_key(&self) -> String {
        format!("step_{}", self.sequence)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit trail
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable record of one lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    #[serde(default)]
    pub id: Id,
    pub entity_kind: EntityKind,
    pub entity_id: Id,
    pub from_state: String,
    pub to_state: String,
    #[serde(default)]
    pub smart_code: String,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub data: Value,
    pub occurred_at: Timestamp,
}

impl TransitionRecord {
    pub fn from_record(record: &TransactionRecord) -> Result<Self> {
        let mut transition: Self = decode(&record.metadata)?;
        transition.id = record.id.clone();
        transition.smart_code = record.smart_code.clone();
        Ok(transition)
    }

    pub fn to_metadata(&self) -> Result<Metadata> {
        encode(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(metadata: &Metadata) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(metadata.clone()))?)
}

fn encode<T: Serialize>(value: &T) -> Result<Metadata> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidInput(format!(
            "expected an object for record metadata, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now;
    use serde_json::json;

    fn step_def() -> StepDefinition {
        serde_json::from_value(json!({
            "playbook_id": "pb-1",
            "name": "score",
            "sequence": 2,
            "worker_type": "ai",
            "depends_on": [1],
            "critical": true
        }))
        .unwrap()
    }

    fn run() -> PlaybookRun {
        PlaybookRun {
            id: "run-1".into(),
            organization_id: "org-1".into(),
            playbook_id: "pb-1".into(),
            status: RunStatus::InProgress,
            inputs: json!({}),
            outputs: None,
            priority: Priority::High,
            correlation_id: "corr".into(),
            progress: RunProgress::default(),
            cost: 0.0,
            ai_confidence: None,
            ai_insights: vec![],
            failure_reason: None,
            validation_errors: vec![],
            created_by: None,
            started_at: Some(now()),
            completed_at: None,
            blocked_at: None,
            escalate_at: None,
        }
    }

    #[test]
    fn test_retry_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1, 60), Duration::from_secs(5));
        assert_eq!(policy.backoff_for(3, 60), Duration::from_secs(120));
        assert_eq!(policy.backoff_for(4, 60), Duration::from_secs(60));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_step_definition_defaults() {
        let def = step_def();
        assert_eq!(def.sla_seconds, 3600);
        assert_eq!(def.step_type, StepType::Standard);
        assert!(def.retry_policy.is_none());
    }

    #[test]
    fn test_step_execution_inherits_run_priority() {
        let exec = StepExecution::from_definition(&step_def(), &run(), StepStatus::Queued);
        assert_eq!(exec.priority, Priority::High);
        assert_eq!(exec.output_key(), "step_2");
        assert!(exec.critical);
    }

    #[test]
    fn test_step_execution_record_identity_wins() {
        let exec = StepExecution::from_definition(&step_def(), &run(), StepStatus::Pending);
        let record = TransactionLineRecord {
            id: "line-9".into(),
            organization_id: "org-1".into(),
            transaction_id: "run-1".into(),
            line_number: 2,
            line_type: "step_execution".into(),
            smart_code: "PLAYBOOK.STEP.EXECUTION.v1".into(),
            entity_id: Some("step-def-2".into()),
            metadata: exec.to_metadata().unwrap(),
            created_at: now(),
            updated_at: now(),
        };
        let decoded = StepExecution::from_record(&record).unwrap();
        assert_eq!(decoded.id, "line-9");
        assert_eq!(decoded.step_id, "step-def-2");
        assert_eq!(decoded.status, StepStatus::Pending);
    }

    #[test]
    fn test_signals_satisfied() {
        let mut exec = StepExecution::from_definition(&step_def(), &run(), StepStatus::Pending);
        exec.required_signals = vec!["docs_uploaded".into()];
        assert!(!exec.signals_satisfied());
        exec.received_signals.push("docs_uploaded".into());
        assert!(exec.signals_satisfied());
    }

    #[test]
    fn test_progress_all_terminal() {
        let mut a = StepExecution::from_definition(&step_def(), &run(), StepStatus::Completed);
        let mut b = a.clone();
        b.status = StepStatus::Skipped;
        let progress = RunProgress::from_steps(&[a.clone(), b]);
        assert!(progress.all_terminal());
        a.status = StepStatus::Running;
        assert!(!RunProgress::from_steps(&[a]).all_terminal());
    }
}
