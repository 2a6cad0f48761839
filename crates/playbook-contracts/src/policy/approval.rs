//! Approval thresholds.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use playbook_types::RiskLevel;

use super::{PolicyKind, PolicyResult, Severity, parse_rules};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approver {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalContext {
    pub amount: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub approvers: Vec<Approver>,
    pub special_circumstances: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApprovalRules {
    tiers: Vec<Tier>,
    special_circumstances: HashMap<String, SpecialCircumstance>,
}

#[derive(Debug, Deserialize)]
struct Tier {
    name: String,
    #[serde(default)]
    min_amount: f64,
    #[serde(default)]
    max_amount: Option<f64>,
    /// Tier used when no amount is known.
    #[serde(default)]
    risk_level: Option<RiskLevel>,
    #[serde(default)]
    required_approvers: usize,
    #[serde(default)]
    required_roles: Vec<String>,
}

impl Tier {
    fn matches(&self, ctx: &ApprovalContext) -> bool {
        match ctx.amount {
            Some(amount) => {
                amount >= self.min_amount && self.max_amount.is_none_or(|max| amount < max)
            }
            None => ctx.risk_level.is_some() && self.risk_level == ctx.risk_level,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpecialCircumstance {
    auto_approve: bool,
    description: Option<String>,
}

/// Check approvers against the tier the amount falls into.
///
/// Shortfalls are `error`; on a high-risk request they are `critical`.
pub fn evaluate(document: Option<&Value>, ctx: &ApprovalContext) -> PolicyResult {
    let Some(document) = document else {
        return PolicyResult::no_policy(PolicyKind::Approval);
    };
    let rules: ApprovalRules = match parse_rules(PolicyKind::Approval, document) {
        Ok(rules) => rules,
        Err(result) => return result,
    };

    for name in &ctx.special_circumstances {
        if let Some(special) = rules.special_circumstances.get(name)
            && special.auto_approve
        {
            let detail = special
                .description
                .as_deref()
                .map(|d| format!(" ({d})"))
                .unwrap_or_default();
            return PolicyResult::pass(
                PolicyKind::Approval,
                format!("auto-approved via special circumstance '{name}'{detail}"),
            )
            .with_metric("special_circumstance", name.as_str());
        }
    }

    let Some(tier) = rules.tiers.iter().find(|t| t.matches(ctx)) else {
        return PolicyResult::pass(PolicyKind::Approval, "no applicable approval tier");
    };

    let shortfall_severity = if ctx.risk_level == Some(RiskLevel::High) {
        Severity::Critical
    } else {
        Severity::Error
    };
    let mut violations = Vec::new();

    if ctx.approvers.len() < tier.required_approvers {
        violations.push((
            shortfall_severity,
            format!(
                "tier '{}' needs {} approver(s), got {}",
                tier.name,
                tier.required_approvers,
                ctx.approvers.len()
            ),
        ));
    }
    let missing: Vec<&str> = tier
        .required_roles
        .iter()
        .filter(|role| !ctx.approvers.iter().any(|a| a.roles.contains(role)))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        violations.push((
            shortfall_severity,
            format!(
                "tier '{}' requires an approver with role(s): {}",
                tier.name,
                missing.join(", ")
            ),
        ));
    }

    let mut result = PolicyResult::from_violations(
        PolicyKind::Approval,
        violations,
        format!("approval tier '{}' satisfied", tier.name),
    )
    .with_metric("tier", tier.name.as_str())
    .with_metric("approvers", ctx.approvers.len() as u64)
    .with_metric("required_approvers", tier.required_approvers as u64);
    if let Some(risk) = ctx.risk_level {
        result = result.with_metric("risk_level", risk.as_str());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> Value {
        json!({"rules": {
            "tiers": [
                {"name": "small", "min_amount": 0, "max_amount": 10000, "required_approvers": 1},
                {"name": "large", "min_amount": 10000, "required_approvers": 2,
                 "required_roles": ["finance_director"]},
                {"name": "unpriced-high", "risk_level": "high", "required_approvers": 3}
            ],
            "special_circumstances": {
                "disaster_relief": {"auto_approve": true, "description": "expedited path"}
            }
        }})
    }

    fn approver(id: &str, roles: &[&str]) -> Approver {
        Approver {
            user_id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_small_tier_satisfied() {
        let ctx = ApprovalContext {
            amount: Some(500.0),
            approvers: vec![approver("a", &[])],
            ..Default::default()
        };
        let result = evaluate(Some(&policy()), &ctx);
        assert!(result.compliant);
        assert_eq!(result.metrics["tier"], "small");
    }

    #[test]
    fn test_large_tier_missing_role() {
        let ctx = ApprovalContext {
            amount: Some(50_000.0),
            risk_level: Some(RiskLevel::Medium),
            approvers: vec![approver("a", &["manager"]), approver("b", &[])],
            ..Default::default()
        };
        let result = evaluate(Some(&policy()), &ctx);
        assert!(!result.compliant);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("finance_director"));
    }

    #[test]
    fn test_high_risk_shortfall_is_critical() {
        let ctx = ApprovalContext {
            amount: Some(90_000.0),
            risk_level: Some(RiskLevel::High),
            ..Default::default()
        };
        assert!(evaluate(Some(&policy()), &ctx).is_critical());
    }

    #[test]
    fn test_special_circumstance_overrides() {
        let ctx = ApprovalContext {
            amount: Some(90_000.0),
            risk_level: Some(RiskLevel::High),
            special_circumstances: vec!["disaster_relief".into()],
            ..Default::default()
        };
        let result = evaluate(Some(&policy()), &ctx);
        assert!(result.compliant);
        assert!(result.message.contains("expedited path"));
    }

    #[test]
    fn test_tier_by_risk_when_no_amount() {
        let ctx = ApprovalContext {
            risk_level: Some(RiskLevel::High),
            approvers: vec![approver("a", &[])],
            ..Default::default()
        };
        let result = evaluate(Some(&policy()), &ctx);
        assert_eq!(result.metrics["tier"], "unpriced-high");
        assert!(!result.compliant);
    }

    #[test]
    fn test_no_tier_passes() {
        let ctx = ApprovalContext::default();
        let result = evaluate(Some(&policy()), &ctx);
        assert!(result.compliant);
        assert_eq!(result.message, "no applicable approval tier");
    }
}
