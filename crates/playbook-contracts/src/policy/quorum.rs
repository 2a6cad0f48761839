//! Committee quorum policy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use playbook_types::Timestamp;

use super::{PolicyKind, PolicyResult, Severity, parse_rules};

const DEFAULT_CONSENSUS: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub decision: VoteDecision,
    #[serde(default)]
    pub conflict_of_interest: bool,
}

impl Vote {
    pub fn new(voter_id: impl Into<String>, decision: VoteDecision) -> Self {
        Self {
            voter_id: voter_id.into(),
            decision,
            conflict_of_interest: false,
        }
    }
}

/// Result of an external conflict-of-interest screen for one voter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCheck {
    pub voter_id: String,
    pub has_conflict: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumContext {
    pub step_name: Option<String>,
    pub voters: Vec<Vote>,
    pub voting_window_start: Option<Timestamp>,
    /// Defaults to now.
    pub current_time: Option<Timestamp>,
    pub conflict_checks: Vec<ConflictCheck>,
}

#[derive(Debug, Deserialize)]
struct QuorumRules {
    #[serde(default)]
    step_name: Option<String>,
    minimum_voters: usize,
    #[serde(default)]
    maximum_voters: Option<usize>,
    #[serde(default)]
    voting_window_hours: Option<f64>,
    #[serde(default)]
    consensus_threshold: Option<f64>,
}

pub fn evaluate(document: Option<&Value>, ctx: &QuorumContext) -> PolicyResult {
    let Some(document) = document else {
        return PolicyResult::no_policy(PolicyKind::Quorum);
    };
    let rules: QuorumRules = match parse_rules(PolicyKind::Quorum, document) {
        Ok(rules) => rules,
        Err(result) => return result,
    };
    if let Some(designated) = &rules.step_name
        && ctx.step_name.as_deref() != Some(designated.as_str())
    {
        return PolicyResult::pass(
            PolicyKind::Quorum,
            format!("quorum applies only to '{designated}'"),
        );
    }

    let mut violations = Vec::new();
    let count = ctx.voters.len();

    if count < rules.minimum_voters {
        violations.push((
            Severity::Error,
            format!(
                "insufficient voters: {count} of {} required",
                rules.minimum_voters
            ),
        ));
    }
    if let Some(max) = rules.maximum_voters
        && count > max
    {
        violations.push((
            Severity::Warning,
            format!("too many voters: {count} exceeds maximum of {max}"),
        ));
    }

    if let (Some(hours), Some(start)) = (rules.voting_window_hours, ctx.voting_window_start) {
        let current = ctx.current_time.unwrap_or_else(playbook_types::now);
        let elapsed_hours = (current - start).num_seconds() as f64 / 3600.0;
        if elapsed_hours > hours {
            violations.push((
                Severity::Error,
                format!("voting window expired: {elapsed_hours:.1}h elapsed of {hours:.1}h"),
            ));
        }
    }

    let mut conflicted: Vec<&str> = ctx
        .voters
        .iter()
        .filter(|v| v.conflict_of_interest)
        .map(|v| v.voter_id.as_str())
        .chain(
            ctx.conflict_checks
                .iter()
                .filter(|c| c.has_conflict)
                .map(|c| c.voter_id.as_str()),
        )
        .collect();
    conflicted.sort_unstable();
    conflicted.dedup();
    if !conflicted.is_empty() {
        violations.push((
            Severity::Critical,
            format!("conflict of interest detected for {}", conflicted.join(", ")),
        ));
    }

    let approvals = ctx
        .voters
        .iter()
        .filter(|v| v.decision == VoteDecision::Approve)
        .count();
    let approve_ratio = if count > 0 {
        approvals as f64 / count as f64
    } else {
        0.0
    };
    let threshold = rules.consensus_threshold.unwrap_or(DEFAULT_CONSENSUS);
    if count >= rules.minimum_voters && count > 0 && approve_ratio < threshold {
        violations.push((
            Severity::Warning,
            format!(
                "consensus not reached: {:.0}% approve, {:.0}% required",
                approve_ratio * 100.0,
                threshold * 100.0
            ),
        ));
    }

    PolicyResult::from_violations(PolicyKind::Quorum, violations, "quorum satisfied")
        .with_metric("voters", count as u64)
        .with_metric("approvals", approvals as u64)
        .with_metric("approve_ratio", approve_ratio)
        .with_metric("minimum_voters", rules.minimum_voters as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn policy() -> Value {
        json!({"rules": {
            "step_name": "committee",
            "minimum_voters": 3,
            "maximum_voters": 5,
            "voting_window_hours": 24,
            "consensus_threshold": 0.6
        }})
    }

    fn votes(decisions: &[VoteDecision]) -> Vec<Vote> {
        decisions
            .iter()
            .enumerate()
            .map(|(i, d)| Vote::new(format!("v{i}"), *d))
            .collect()
    }

    fn ctx(voters: Vec<Vote>) -> QuorumContext {
        QuorumContext {
            step_name: Some("committee".into()),
            voters,
            ..Default::default()
        }
    }

    #[test]
    fn test_insufficient_voters_is_error() {
        use VoteDecision::*;
        let result = evaluate(Some(&policy()), &ctx(votes(&[Approve, Approve])));
        assert!(!result.compliant);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("2 of 3"));
    }

    #[test]
    fn test_quorum_met() {
        use VoteDecision::*;
        let result = evaluate(Some(&policy()), &ctx(votes(&[Approve, Approve, Reject])));
        assert!(result.compliant, "{}", result.message);
    }

    #[test]
    fn test_low_consensus_is_warning() {
        use VoteDecision::*;
        let result = evaluate(Some(&policy()), &ctx(votes(&[Approve, Reject, Abstain])));
        assert!(!result.compliant);
        assert_eq!(result.severity, Severity::Warning);
    }

    #[test]
    fn test_conflict_is_critical() {
        use VoteDecision::*;
        let mut c = ctx(votes(&[Approve, Approve, Approve]));
        c.conflict_checks.push(ConflictCheck {
            voter_id: "v1".into(),
            has_conflict: true,
            reason: Some("applicant's spouse".into()),
        });
        let result = evaluate(Some(&policy()), &c);
        assert_eq!(result.severity, Severity::Critical);
        assert!(result.is_critical());
    }

    #[test]
    fn test_expired_window() {
        use VoteDecision::*;
        let now = playbook_types::now();
        let mut c = ctx(votes(&[Approve, Approve, Approve]));
        c.voting_window_start = Some(now - Duration::hours(30));
        c.current_time = Some(now);
        let result = evaluate(Some(&policy()), &c);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("voting window expired"));
    }

    #[test]
    fn test_other_step_not_applicable() {
        let mut c = ctx(vec![]);
        c.step_name = Some("intake".into());
        assert!(evaluate(Some(&policy()), &c).compliant);
    }
}
