//! SLA timing policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use playbook_types::Timestamp;

use super::{PolicyKind, PolicyResult, Severity, parse_rules};

/// Overrun beyond which a breach becomes critical.
const CRITICAL_OVERRUN: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaContext {
    #[serde(default)]
    pub step_name: Option<String>,
    pub start_time: Timestamp,
    /// Defaults to now.
    #[serde(default)]
    pub current_time: Option<Timestamp>,
    /// Overrides the policy's own `business_hours_only`.
    #[serde(default)]
    pub business_hours_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SlaRules {
    overall_hours: Option<f64>,
    business_hours_only: bool,
    steps: HashMap<String, StepSla>,
}

#[derive(Debug, Deserialize)]
struct StepSla {
    max_hours: f64,
}

/// Compare elapsed time against the step rule, falling back to the overall
/// playbook SLA.
///
/// With business-hours counting, elapsed minutes are divided by the fraction
/// of the day that counts (`business_hours_per_day / 24`).
pub fn evaluate(
    document: Option<&Value>,
    ctx: &SlaContext,
    business_hours_per_day: f64,
) -> PolicyResult {
    let Some(document) = document else {
        return PolicyResult::no_policy(PolicyKind::Sla);
    };
    let rules: SlaRules = match parse_rules(PolicyKind::Sla, document) {
        Ok(rules) => rules,
        Err(result) => return result,
    };

    let step_rule = ctx
        .step_name
        .as_deref()
        .and_then(|name| rules.steps.get(name));
    let (allowed_hours, scope) = match (step_rule, rules.overall_hours) {
        (Some(rule), _) => (rule.max_hours, "step"),
        (None, Some(hours)) => (hours, "overall"),
        (None, None) => {
            return PolicyResult::pass(PolicyKind::Sla, "no applicable SLA rule");
        }
    };

    let current = ctx.current_time.unwrap_or_else(playbook_types::now);
    let mut elapsed_minutes = (current - ctx.start_time).num_seconds() as f64 / 60.0;
    let business_hours_only = ctx.business_hours_only.unwrap_or(rules.business_hours_only);
    if business_hours_only && business_hours_per_day > 0.0 {
        elapsed_minutes /= business_hours_per_day / 24.0;
    }

    let elapsed_hours = elapsed_minutes / 60.0;
    let ratio = if allowed_hours > 0.0 {
        elapsed_hours / allowed_hours
    } else {
        f64::INFINITY
    };
    let label = match &ctx.step_name {
        Some(name) if scope == "step" => format!("step '{name}'"),
        _ => "playbook".to_string(),
    };

    let result = if elapsed_hours <= allowed_hours {
        PolicyResult::pass(
            PolicyKind::Sla,
            format!("{label} within SLA ({elapsed_hours:.2}h of {allowed_hours:.2}h)"),
        )
    } else {
        let severity = if ratio - 1.0 <= CRITICAL_OVERRUN {
            Severity::Warning
        } else {
            Severity::Critical
        };
        PolicyResult::fail(
            PolicyKind::Sla,
            severity,
            format!(
                "{label} exceeded SLA: {elapsed_hours:.2}h elapsed against {allowed_hours:.2}h allowed"
            ),
        )
    };

    result
        .with_metric("elapsed_hours", elapsed_hours)
        .with_metric("allowed_hours", allowed_hours)
        .with_metric("ratio", if ratio.is_finite() { ratio } else { -1.0 })
        .with_metric("scope", scope)
        .with_metric("business_hours_only", business_hours_only)
}
