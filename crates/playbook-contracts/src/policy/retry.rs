//! Retry budget policy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PolicyKind, PolicyResult, Severity, parse_rules};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryContext {
    pub step_name: String,
    /// Attempts already made before this one.
    pub attempt: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryRules {
    steps: HashMap<String, StepRetry>,
    default_max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StepRetry {
    max_attempts: u32,
}

/// A step that has used up its retry budget is a `warning`.
pub fn evaluate(document: Option<&Value>, ctx: &RetryContext) -> PolicyResult {
    let Some(document) = document else {
        return PolicyResult::no_policy(PolicyKind::Retry);
    };
    let rules: RetryRules = match parse_rules(PolicyKind::Retry, document) {
        Ok(rules) => rules,
        Err(result) => return result,
    };
    let max_attempts = match rules.steps.get(&ctx.step_name) {
        Some(rule) => rule.max_attempts,
        None => match rules.default_max_attempts {
            Some(max) => max,
            None => {
                return PolicyResult::pass(
                    PolicyKind::Retry,
                    format!("no retry rule for '{}'", ctx.step_name),
                );
            }
        },
    };

    let result = if ctx.attempt < max_attempts {
        PolicyResult::pass(
            PolicyKind::Retry,
            format!(
                "'{}' attempt {} within budget of {max_attempts}",
                ctx.step_name,
                ctx.attempt + 1
            ),
        )
    } else {
        PolicyResult::fail(
            PolicyKind::Retry,
            Severity::Warning,
            format!(
                "'{}' exceeded retry budget: attempt {} of {max_attempts}",
                ctx.step_name,
                ctx.attempt + 1
            ),
        )
    };
    result
        .with_metric("attempt", ctx.attempt)
        .with_metric("max_attempts", max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(step: &str, attempt: u32) -> RetryContext {
        RetryContext {
            step_name: step.into(),
            attempt,
        }
    }

    #[test]
    fn test_within_and_beyond_budget() {
        let doc = json!({"rules": {"steps": {"score": {"max_attempts": 2}}, "default_max_attempts": 5}});
        assert!(evaluate(Some(&doc), &ctx("score", 1)).compliant);

        let exceeded = evaluate(Some(&doc), &ctx("score", 2));
        assert!(!exceeded.compliant);
        assert_eq!(exceeded.severity, Severity::Warning);

        assert!(evaluate(Some(&doc), &ctx("other", 4)).compliant);
    }

    #[test]
    fn test_no_rule_passes() {
        let doc = json!({"rules": {}});
        assert!(evaluate(Some(&doc), &ctx("score", 9)).compliant);
        assert!(evaluate(None, &ctx("score", 9)).compliant);
    }
}
