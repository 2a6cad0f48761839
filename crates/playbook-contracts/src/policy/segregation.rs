//! Segregation of duties.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PolicyKind, PolicyResult, Severity, parse_rules};

/// Who executed an earlier step of the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousStepUser {
    pub step_name: String,
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A screened relationship between the current user and a party to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipCheck {
    pub relationship_type: String,
    #[serde(default)]
    pub related_party: Option<String>,
    pub detected: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SegregationContext {
    pub step_name: String,
    pub current_user_id: String,
    pub current_user_roles: Vec<String>,
    pub previous_step_users: Vec<PreviousStepUser>,
    pub relationship_checks: Vec<RelationshipCheck>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SegregationRules {
    steps: HashMap<String, StepRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StepRule {
    allowed_roles: Vec<String>,
    mutually_exclusive_with: Vec<String>,
    prohibited_role_combinations: Vec<Vec<String>>,
    prohibited_relationships: Vec<String>,
}

/// Every segregation breach is critical.
pub fn evaluate(document: Option<&Value>, ctx: &SegregationContext) -> PolicyResult {
    let Some(document) = document else {
        return PolicyResult::no_policy(PolicyKind::Segregation);
    };
    let rules: SegregationRules = match parse_rules(PolicyKind::Segregation, document) {
        Ok(rules) => rules,
        Err(result) => return result,
    };
    let Some(rule) = rules.steps.get(&ctx.step_name) else {
        return PolicyResult::pass(
            PolicyKind::Segregation,
            format!("no segregation rule for '{}'", ctx.step_name),
        );
    };

    let mut violations = Vec::new();

    if !rule.allowed_roles.is_empty()
        && !ctx
            .current_user_roles
            .iter()
            .any(|r| rule.allowed_roles.contains(r))
    {
        violations.push((
            Severity::Critical,
            format!(
                "user '{}' holds none of the roles allowed for '{}' ({})",
                ctx.current_user_id,
                ctx.step_name,
                rule.allowed_roles.join(", ")
            ),
        ));
    }

    let own_previous: Vec<&PreviousStepUser> = ctx
        .previous_step_users
        .iter()
        .filter(|p| p.user_id == ctx.current_user_id)
        .collect();

    for previous in &own_previous {
        if rule.mutually_exclusive_with.contains(&previous.step_name) {
            violations.push((
                Severity::Critical,
                format!(
                    "user '{}' already executed '{}', which is mutually exclusive with '{}'",
                    ctx.current_user_id, previous.step_name, ctx.step_name
                ),
            ));
        }
    }

    let held: HashSet<&str> = ctx
        .current_user_roles
        .iter()
        .chain(own_previous.iter().flat_map(|p| p.roles.iter()))
        .map(String::as_str)
        .collect();
    for combination in &rule.prohibited_role_combinations {
        if combination.len() >= 2 && combination.iter().all(|r| held.contains(r.as_str())) {
            violations.push((
                Severity::Critical,
                format!(
                    "user '{}' would combine prohibited roles {}",
                    ctx.current_user_id,
                    combination.join(" + ")
                ),
            ));
        }
    }

    for check in ctx.relationship_checks.iter().filter(|c| c.detected) {
        if rule.prohibited_relationships.contains(&check.relationship_type) {
            let party = check
                .related_party
                .as_deref()
                .map(|p| format!(" with '{p}'"))
                .unwrap_or_default();
            violations.push((
                Severity::Critical,
                format!(
                    "prohibited {} relationship detected{party}",
                    check.relationship_type
                ),
            ));
        }
    }

    let violation_count = violations.len();
    PolicyResult::from_violations(
        PolicyKind::Segregation,
        violations,
        format!("segregation of duties satisfied for '{}'", ctx.step_name),
    )
    .with_metric("violation_count", violation_count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> Value {
        json!({"rules": {"steps": {
            "approve": {
                "allowed_roles": ["approver", "director"],
                "mutually_exclusive_with": ["submit"],
                "prohibited_role_combinations": [["requester", "approver"]],
                "prohibited_relationships": ["familial", "financial"]
            }
        }}})
    }

    fn ctx(user: &str, roles: &[&str]) -> SegregationContext {
        SegregationContext {
            step_name: "approve".into(),
            current_user_id: user.into(),
            current_user_roles: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_allowed_role_passes() {
        assert!(evaluate(Some(&policy()), &ctx("u1", &["approver"])).compliant);
    }

    #[test]
    fn test_missing_role_is_critical() {
        let result = evaluate(Some(&policy()), &ctx("u1", &["clerk"]));
        assert!(result.is_critical());
    }

    #[test]
    fn test_mutually_exclusive_steps() {
        let mut c = ctx("u1", &["approver"]);
        c.previous_step_users.push(PreviousStepUser {
            step_name: "submit".into(),
            user_id: "u1".into(),
            roles: vec![],
        });
        let result = evaluate(Some(&policy()), &c);
        assert!(result.is_critical());
        assert!(result.message.contains("mutually exclusive"));

        c.previous_step_users[0].user_id = "u2".into();
        assert!(evaluate(Some(&policy()), &c).compliant);
    }

    #[test]
    fn test_role_combination_across_steps() {
        let mut c = ctx("u1", &["approver"]);
        c.previous_step_users.push(PreviousStepUser {
            step_name: "intake".into(),
            user_id: "u1".into(),
            roles: vec!["requester".into()],
        });
        let result = evaluate(Some(&policy()), &c);
        assert!(result.is_critical());
        assert!(result.message.contains("requester + approver"));
    }

    #[test]
    fn test_prohibited_relationship() {
        let mut c = ctx("u1", &["director"]);
        c.relationship_checks.push(RelationshipCheck {
            relationship_type: "familial".into(),
            related_party: Some("applicant-7".into()),
            detected: true,
        });
        c.relationship_checks.push(RelationshipCheck {
            relationship_type: "professional".into(),
            related_party: None,
            detected: true,
        });
        let result = evaluate(Some(&policy()), &c);
        assert_eq!(result.violations.len(), 1);
        assert!(result.is_critical());
    }

    #[test]
    fn test_unlisted_step_passes() {
        let mut c = ctx("u1", &[]);
        c.step_name = "intake".into();
        assert!(evaluate(Some(&policy()), &c).compliant);
    }
}
