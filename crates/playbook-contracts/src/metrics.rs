//! Per-run validation metrics and the compliance score.

use serde::{Deserialize, Serialize};

use crate::policy::{PolicyResult, Severity};
use crate::result::ValidationResult;

/// Weight of contract validity in the compliance score.
const CONTRACT_WEIGHT: f64 = 0.4;
/// Weight of policy compliance in the compliance score.
const POLICY_WEIGHT: f64 = 0.6;

/// One contract check as recorded for metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractCheck {
    /// e.g. `playbook_input`, `step_output:score`.
    pub contract: String,
    pub valid: bool,
    pub error_count: usize,
    pub validation_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub contract_checks: Vec<ContractCheck>,
    pub policy_results: Vec<PolicyResult>,
}

impl ValidationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_contract(&mut self, contract: impl Into<String>, result: &ValidationResult) {
        self.contract_checks.push(ContractCheck {
            contract: contract.into(),
            valid: result.valid,
            error_count: result.errors.len(),
            validation_time_ms: result.performance.validation_time_ms,
        });
    }

    pub fn record_policy(&mut self, result: PolicyResult) {
        self.policy_results.push(result);
    }

    /// Fold another set of metrics into this aggregate.
    pub fn merge(&mut self, other: ValidationMetrics) {
        self.contract_checks.extend(other.contract_checks);
        self.policy_results.extend(other.policy_results);
    }

    pub fn is_empty(&self) -> bool {
        self.contract_checks.is_empty() && self.policy_results.is_empty()
    }

    /// Percentage of valid contract checks; 100 when none were made.
    pub fn contract_validity(&self) -> f64 {
        percentage(
            self.contract_checks.iter().filter(|c| c.valid).count(),
            self.contract_checks.len(),
        )
    }

    /// Percentage of compliant policy results; 100 when none were evaluated.
    pub fn policy_compliance(&self) -> f64 {
        percentage(
            self.policy_results.iter().filter(|p| p.compliant).count(),
            self.policy_results.len(),
        )
    }

    /// Blended 0-100 score: 40% contract validity, 60% policy compliance.
    pub fn compliance_score(&self) -> u8 {
        let score = CONTRACT_WEIGHT * self.contract_validity()
            + POLICY_WEIGHT * self.policy_compliance();
        score.round().clamp(0.0, 100.0) as u8
    }

    /// Non-compliant policy results at or above `severity`.
    pub fn violations_at_least(&self, severity: Severity) -> Vec<&PolicyResult> {
        self.policy_results
            .iter()
            .filter(|p| !p.compliant && p.severity >= severity)
            .collect()
    }
}

/// Compliance for one run: the checks made at run boundaries plus one
/// score per executed step.
///
/// Once any step has executed, the run score is the mean of the step
/// scores; before that it is the score of the run-level checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Playbook input, start-of-run approval and playbook output checks.
    pub run_checks: ValidationMetrics,
    /// One entry per step execution, retries included.
    pub step_scores: Vec<u8>,
    /// Every check made for the run.
    pub all: ValidationMetrics,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run_checks(&mut self, metrics: ValidationMetrics) {
        self.run_checks.merge(metrics.clone());
        self.all.merge(metrics);
    }

    /// Record a finished step execution; returns its score.
    pub fn record_step(&mut self, metrics: ValidationMetrics) -> u8 {
        let score = metrics.compliance_score();
        self.step_scores.push(score);
        self.all.merge(metrics);
        score
    }

    pub fn compliance_score(&self) -> u8 {
        if self.step_scores.is_empty() {
            return self.run_checks.compliance_score();
        }
        let total: u32 = self.step_scores.iter().map(|&s| u32::from(s)).sum();
        let mean = f64::from(total) / self.step_scores.len() as f64;
        mean.round().clamp(0.0, 100.0) as u8
    }
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
