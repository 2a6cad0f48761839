//! What a worker and the validation middleware see for one step.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use playbook_contracts::{Approver, ConflictCheck, PreviousStepUser, RelationshipCheck, Vote};
use playbook_types::{PlaybookRun, RiskLevel, StepDefinition, StepExecution, StepStatus, Timestamp};

/// Who is executing a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Governance facts carried in a step's inputs.
///
/// Each field is read from the top-level key of the same name; a malformed
/// value is ignored rather than failing the step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub actor: Option<Actor>,
    pub voters: Vec<Vote>,
    pub voting_window_start: Option<Timestamp>,
    pub conflict_checks: Vec<ConflictCheck>,
    pub relationship_checks: Vec<RelationshipCheck>,
    pub previous_step_users: Vec<PreviousStepUser>,
    pub approvers: Vec<Approver>,
    pub special_circumstances: Vec<String>,
    pub amount: Option<f64>,
    pub risk_level: Option<RiskLevel>,
    pub business_hours_only: Option<bool>,
}

/// Keys that may carry the monetary amount used for approval tiers.
const AMOUNT_KEYS: [&str; 3] = ["amount", "total_amount", "requested_amount"];

impl ExecutionContext {
    pub fn from_inputs(inputs: &Value) -> Self {
        Self {
            actor: field(inputs, "actor"),
            voters: field(inputs, "voters").unwrap_or_default(),
            voting_window_start: field(inputs, "voting_window_start"),
            conflict_checks: field(inputs, "conflict_checks").unwrap_or_default(),
            relationship_checks: field(inputs, "relationship_checks").unwrap_or_default(),
            previous_step_users: field(inputs, "previous_step_users").unwrap_or_default(),
            approvers: field(inputs, "approvers").unwrap_or_default(),
            special_circumstances: field(inputs, "special_circumstances").unwrap_or_default(),
            amount: amount_of(inputs),
            risk_level: field(inputs, "risk_level"),
            business_hours_only: field(inputs, "business_hours_only"),
        }
    }

    /// Explicit risk level, else derived from the amount.
    pub fn effective_risk(&self) -> Option<RiskLevel> {
        self.risk_level
            .or_else(|| self.amount.map(RiskLevel::from_amount))
    }

    pub fn actor_id(&self) -> &str {
        self.actor.as_ref().map(|a| a.user_id.as_str()).unwrap_or("")
    }
}

/// First numeric (or numeric string) amount field in `inputs`.
pub fn amount_of(inputs: &Value) -> Option<f64> {
    AMOUNT_KEYS.iter().find_map(|key| match inputs.get(*key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn field<T: DeserializeOwned>(inputs: &Value, key: &str) -> Option<T> {
    inputs
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// One step ready for a worker.
#[derive(Debug, Clone)]
pub struct StepDispatch {
    pub run: PlaybookRun,
    pub step: StepExecution,
    pub definition: StepDefinition,
    /// Resolved inputs: run inputs, earlier step outputs, overrides.
    pub inputs: Value,
    pub context: ExecutionContext,
    /// Steps of the same run that already completed.
    pub completed: Vec<StepExecution>,
}

impl StepDispatch {
    /// Users who executed earlier steps, plus any listed in the inputs.
    pub fn previous_step_users(&self) -> Vec<PreviousStepUser> {
        let mut users: Vec<PreviousStepUser> = self
            .completed
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| {
                s.worker_id.as_ref().map(|user_id| PreviousStepUser {
                    step_name: s.name.clone(),
                    user_id: user_id.clone(),
                    roles: Vec::new(),
                })
            })
            .collect();
        for listed in &self.context.previous_step_users {
            if !users
                .iter()
                .any(|u| u.step_name == listed.step_name && u.user_id == listed.user_id)
            {
                users.push(listed.clone());
            }
        }
        users
    }

    /// Idempotency key for external calls: `<step_id>-<attempt>`.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.step.id, self.step.attempt)
    }

    pub fn inputs_object(&self) -> Map<String, Value> {
        self.inputs.as_object().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_reads_known_keys() {
        let inputs = json!({
            "actor": {"user_id": "alice", "roles": ["reviewer"]},
            "voters": [
                {"voter_id": "v1", "decision": "approve"},
                {"voter_id": "v2", "decision": "reject"}
            ],
            "total_amount": "80000",
            "unrelated": 1
        });
        let ctx = ExecutionContext::from_inputs(&inputs);
        assert_eq!(ctx.actor_id(), "alice");
        assert_eq!(ctx.voters.len(), 2);
        assert_eq!(ctx.amount, Some(80_000.0));
        assert_eq!(ctx.effective_risk(), Some(RiskLevel::High));
    }

    #[test]
    fn test_malformed_fields_are_ignored() {
        let inputs = json!({"voters": "not a list", "approvers": [{"roles": []}]});
        let ctx = ExecutionContext::from_inputs(&inputs);
        assert!(ctx.voters.is_empty());
        assert!(ctx.approvers.is_empty());
        assert_eq!(ctx.effective_risk(), None);
    }
}
