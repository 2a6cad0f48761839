//! Declarative policy evaluation.
//!
//! Policies are JSON documents stored as dynamic fields on the playbook
//! entity, each with a `rules` object. Evaluators here are pure: they take
//! the parsed document (if any) and a context describing the situation, and
//! return a [`PolicyResult`]. A violation is data, never an error; severity
//! tells the caller whether to warn or block.
//!
//! ```text
//! sla_policy          ──► sla::evaluate
//! quorum_policy       ──► quorum::evaluate
//! segregation_policy  ──► segregation::evaluate
//! approval_policy     ──► approval::evaluate
//! retry_policy        ──► retry::evaluate
//! ```

pub mod approval;
pub mod quorum;
pub mod retry;
pub mod segregation;
pub mod sla;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use approval::{ApprovalContext, Approver};
pub use quorum::{ConflictCheck, QuorumContext, Vote, VoteDecision};
pub use retry::RetryContext;
pub use segregation::{PreviousStepUser, RelationshipCheck, SegregationContext};
pub use sla::SlaContext;

/// Which policy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Sla,
    Quorum,
    Segregation,
    Approval,
    Retry,
}

impl PolicyKind {
    /// Dynamic field holding this policy's document.
    pub fn field_name(&self) -> &'static str {
        match self {
            PolicyKind::Sla => "sla_policy",
            PolicyKind::Quorum => "quorum_policy",
            PolicyKind::Segregation => "segregation_policy",
            PolicyKind::Approval => "approval_policy",
            PolicyKind::Retry => "retry_policy",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Sla => "sla",
            PolicyKind::Quorum => "quorum",
            PolicyKind::Segregation => "segregation",
            PolicyKind::Approval => "approval",
            PolicyKind::Retry => "retry",
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: PolicyKind,
    pub compliant: bool,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl PolicyResult {
    pub fn pass(policy: PolicyKind, message: impl Into<String>) -> Self {
        Self {
            policy,
            compliant: true,
            severity: Severity::Info,
            message: message.into(),
            violations: Vec::new(),
            metrics: Map::new(),
        }
    }

    /// Compliant result for a playbook without this policy.
    pub fn no_policy(policy: PolicyKind) -> Self {
        Self::pass(policy, format!("no {policy} policy defined"))
    }

    pub fn fail(policy: PolicyKind, severity: Severity, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            policy,
            compliant: false,
            severity,
            violations: vec![message.clone()],
            message,
            metrics: Map::new(),
        }
    }

    /// Build from accumulated violations; compliant when there are none.
    pub fn from_violations(
        policy: PolicyKind,
        violations: Vec<(Severity, String)>,
        pass_message: impl Into<String>,
    ) -> Self {
        if violations.is_empty() {
            return Self::pass(policy, pass_message);
        }
        let severity = violations
            .iter()
            .map(|(s, _)| *s)
            .max()
            .unwrap_or(Severity::Warning);
        let messages: Vec<String> = violations.into_iter().map(|(_, m)| m).collect();
        Self {
            policy,
            compliant: false,
            severity,
            message: messages.join("; "),
            violations: messages,
            metrics: Map::new(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        !self.compliant && self.severity == Severity::Critical
    }
}

/// Parse a policy document's `rules` object.
///
/// A malformed document is reported as an `error`-severity non-compliance
/// instead of failing the caller.
pub(crate) fn parse_rules<T: DeserializeOwned>(
    policy: PolicyKind,
    document: &Value,
) -> std::result::Result<T, PolicyResult> {
    let rules = document.get("rules").cloned().unwrap_or(Value::Null);
    serde_json::from_value(rules).map_err(|e| {
        PolicyResult::fail(
            policy,
            Severity::Error,
            format!("malformed {policy} policy: {e}"),
        )
    })
}
