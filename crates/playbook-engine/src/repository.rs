//! Typed access to playbooks, runs and steps over the generic record store.
//!
//! ```text
//! playbook definition ── entity (playbook_definition)
//!   ├─ has_step ──────── entity (playbook_step)
//!   ├─ contracts ─────── dynamic fields input_contract / output_contract
//!   └─ policies ──────── dynamic fields *_policy
//! run ────────────────── transaction (playbook_run) → playbook entity
//!   └─ step execution ── transaction line (step_execution)
//! audit ──────────────── transactions (state_transition, compliance_audit, human_task)
//! ```

use serde_json::{Value, json};
use tracing::debug;

use playbook_contracts::PolicyKind;
use playbook_store::{RecordFilter, SharedStore};
use playbook_types::record::metadata_str;
use playbook_types::smart_code::{
    self, ENTITY_PLAYBOOK, ENTITY_STEP, LINE_STEP, REL_HAS_STEP, TXN_COMPLIANCE, TXN_HUMAN_TASK,
    TXN_RUN, TXN_TRANSITION,
};
use playbook_types::{
    EntityKind, Id, Metadata, NewEntity, NewRelationship, NewTransaction, NewTransactionLine,
    PlaybookDefinition, PlaybookRun, PlaybookStatus, RunStatus, StepDefinition, StepExecution,
    StepStatus, Timestamp, TransactionRecord, TransitionRecord,
};

use crate::error::{EngineError, Result};

/// Current lifecycle state of a record, plus the organization that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordState {
    pub organization_id: Id,
    pub status: String,
}

#[derive(Clone)]
pub struct PlaybookRepository {
    store: SharedStore,
}

impl PlaybookRepository {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playbook definitions
    // ─────────────────────────────────────────────────────────────────────

    pub async fn create_playbook(
        &self,
        organization_id: &str,
        code: &str,
        name: &str,
        description: &str,
    ) -> Result<PlaybookDefinition> {
        let def = PlaybookDefinition {
            id: Id::new(),
            organization_id: organization_id.to_string(),
            code: code.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: PlaybookStatus::Draft,
            version: 1,
            published_at: None,
            archived_at: None,
        };
        let record = self
            .store
            .create_entity(NewEntity {
                organization_id: organization_id.to_string(),
                entity_type: ENTITY_PLAYBOOK.to_string(),
                entity_code: code.to_string(),
                entity_name: name.to_string(),
                smart_code: smart_code::PLAYBOOK_DEFINITION.to_string(),
                metadata: def.to_metadata()?,
            })
            .await?;
        debug!(playbook_id = %record.id, code, "Created playbook");
        Ok(PlaybookDefinition::from_record(&record)?)
    }

    pub async fn get_playbook(&self, id: &str) -> Result<PlaybookDefinition> {
        let record = self.store.get_entity(id).await?;
        if record.entity_type != ENTITY_PLAYBOOK {
            return Err(not_a(id, ENTITY_PLAYBOOK));
        }
        Ok(PlaybookDefinition::from_record(&record)?)
    }

    /// Add a step to a draft playbook.
    pub async fn add_step(&self, playbook_id: &str, mut def: StepDefinition) -> Result<StepDefinition> {
        let playbook = self.get_playbook(playbook_id).await?;
        require_draft(&playbook)?;
        if def.sequence == 0 {
            return Err(EngineError::InvalidDefinition(format!(
                "step '{}' must have a sequence of at least 1",
                def.name
            )));
        }
        def.playbook_id = playbook.id.clone();

        let record = self
            .store
            .create_entity(NewEntity {
                organization_id: playbook.organization_id.clone(),
                entity_type: ENTITY_STEP.to_string(),
                entity_code: format!("{}-{}", playbook.code, def.sequence),
                entity_name: def.name.clone(),
                smart_code: smart_code::STEP_DEFINITION.to_string(),
                metadata: def.to_metadata()?,
            })
            .await?;
        self.store
            .create_relationship(NewRelationship {
                organization_id: playbook.organization_id.clone(),
                from_entity_id: playbook.id.clone(),
                to_entity_id: record.id.clone(),
                relationship_type: REL_HAS_STEP.to_string(),
                smart_code: smart_code::HAS_STEP.to_string(),
                metadata: object(json!({ "sequence": def.sequence })),
            })
            .await?;
        Ok(StepDefinition::from_record(&record)?)
    }

    /// Step definitions ordered by sequence.
    pub async fn steps(&self, playbook_id: &str) -> Result<Vec<StepDefinition>> {
        let links = self
            .store
            .query_relationships(playbook_id, REL_HAS_STEP)
            .await?;
        let mut steps = Vec::with_capacity(links.len());
        for link in links {
            let record = self.store.get_entity(&link.to_entity_id).await?;
            steps.push(StepDefinition::from_record(&record)?);
        }
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }

    pub async fn get_step_definition(&self, id: &str) -> Result<StepDefinition> {
        let record = self.store.get_entity(id).await?;
        if record.entity_type != ENTITY_STEP {
            return Err(not_a(id, ENTITY_STEP));
        }
        Ok(StepDefinition::from_record(&record)?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Contracts and policies
    // ─────────────────────────────────────────────────────────────────────

    /// Store a contract on a playbook or step. Contracts freeze once the
    /// owning playbook leaves draft.
    pub async fn set_contract(&self, entity_id: &str, field: &str, schema: Value) -> Result<()> {
        let record = self.store.get_entity(entity_id).await?;
        let playbook_id = match record.entity_type.as_str() {
            ENTITY_PLAYBOOK => record.id.clone(),
            ENTITY_STEP => metadata_str(&record.metadata, "playbook_id")
                .map(str::to_string)
                .ok_or_else(|| {
                    EngineError::InvalidDefinition(format!("step {entity_id} has no playbook"))
                })?,
            other => {
                return Err(EngineError::InvalidDefinition(format!(
                    "contracts cannot be attached to a {other}"
                )));
            }
        };
        let playbook = self.get_playbook(&playbook_id).await?;
        require_draft(&playbook)?;
        self.store
            .set_dynamic_field(entity_id, field, schema)
            .await?;
        Ok(())
    }

    pub async fn contract(&self, entity_id: &str, field: &str) -> Result<Option<Value>> {
        Ok(self.store.get_dynamic_field(entity_id, field).await?)
    }

    pub async fn set_policy(&self, playbook_id: &str, kind: PolicyKind, document: Value) -> Result<()> {
        self.get_playbook(playbook_id).await?;
        self.store
            .set_dynamic_field(playbook_id, kind.field_name(), document)
            .await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a new run. The store assigns the id.
    pub async fn create_run(&self, run: &PlaybookRun) -> Result<PlaybookRun> {
        let record = self
            .store
            .create_transaction(NewTransaction {
                organization_id: run.organization_id.clone(),
                transaction_type: TXN_RUN.to_string(),
                transaction_code: format!("RUN-{}", run.correlation_id),
                smart_code: smart_code::PLAYBOOK_RUN.to_string(),
                reference_entity_id: Some(run.playbook_id.clone()),
                metadata: run.to_metadata()?,
            })
            .await?;
        Ok(PlaybookRun::from_record(&record)?)
    }

    pub async fn get_run(&self, id: &str) -> Result<PlaybookRun> {
        let record = self.store.get_transaction(id).await?;
        if record.transaction_type != TXN_RUN {
            return Err(not_a(id, TXN_RUN));
        }
        Ok(PlaybookRun::from_record(&record)?)
    }

    /// Runs of a playbook in creation order.
    pub async fn runs_for_playbook(&self, playbook_id: &str) -> Result<Vec<PlaybookRun>> {
        let records = self
            .store
            .query_transactions(&RecordFilter::new().record_type(TXN_RUN).parent(playbook_id))
            .await?;
        records.iter().map(|r| Ok(PlaybookRun::from_record(r)?)).collect()
    }

    pub async fn runs_with_status(
        &self,
        organization_id: &str,
        status: RunStatus,
    ) -> Result<Vec<PlaybookRun>> {
        let records = self
            .store
            .query_transactions(
                &RecordFilter::new()
                    .organization(organization_id)
                    .record_type(TXN_RUN)
                    .metadata_eq("status", status.as_str()),
            )
            .await?;
        records.iter().map(|r| Ok(PlaybookRun::from_record(r)?)).collect()
    }

    pub async fn update_run(&self, id: &str, patch: Metadata) -> Result<()> {
        self.store.update_transaction(id, patch).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Step executions
    // ─────────────────────────────────────────────────────────────────────

    pub async fn create_step_execution(&self, exec: &StepExecution) -> Result<StepExecution> {
        let record = self
            .store
            .create_transaction_line(NewTransactionLine {
                organization_id: exec.organization_id.clone(),
                transaction_id: exec.run_id.clone(),
                line_number: exec.sequence,
                line_type: LINE_STEP.to_string(),
                smart_code: smart_code::STEP_EXECUTION.to_string(),
                entity_id: Some(exec.step_id.clone()),
                metadata: exec.to_metadata()?,
            })
            .await?;
        Ok(StepExecution::from_record(&record)?)
    }

    pub async fn get_step_execution(&self, id: &str) -> Result<StepExecution> {
        let record = self.store.get_transaction_line(id).await?;
        if record.line_type != LINE_STEP {
            return Err(not_a(id, LINE_STEP));
        }
        Ok(StepExecution::from_record(&record)?)
    }

    /// Step executions of a run ordered by sequence.
    pub async fn run_steps(&self, run_id: &str) -> Result<Vec<StepExecution>> {
        let records = self
            .store
            .query_transaction_lines(&RecordFilter::new().record_type(LINE_STEP).parent(run_id))
            .await?;
        let mut steps = records
            .iter()
            .map(StepExecution::from_record)
            .collect::<playbook_types::Result<Vec<_>>>()?;
        steps.sort_by_key(|s| s.sequence);
        Ok(steps)
    }

    pub async fn steps_with_status(
        &self,
        organization_id: &str,
        status: StepStatus,
    ) -> Result<Vec<StepExecution>> {
        let records = self
            .store
            .query_transaction_lines(
                &RecordFilter::new()
                    .organization(organization_id)
                    .record_type(LINE_STEP)
                    .metadata_eq("status", status.as_str()),
            )
            .await?;
        records
            .iter()
            .map(|r| Ok(StepExecution::from_record(r)?))
            .collect()
    }

    pub async fn update_step_execution(&self, id: &str, patch: Metadata) -> Result<()> {
        self.store.update_transaction_line(id, patch).await?;
        Ok(())
    }

    /// Apply `patch` only if the step is still in `expected`.
    pub async fn claim_step(&self, id: &str, expected: StepStatus, patch: Metadata) -> Result<bool> {
        Ok(self
            .store
            .claim_transaction_line(id, expected.as_str(), patch)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle state
    // ─────────────────────────────────────────────────────────────────────

    /// Status and owning organization of a playbook, run or step.
    pub async fn state_of(&self, kind: EntityKind, id: &str) -> Result<RecordState> {
        let (organization_id, metadata) = match kind {
            EntityKind::Playbook => {
                let record = self.store.get_entity(id).await?;
                (record.organization_id, record.metadata)
            }
            EntityKind::Run => {
                let record = self.store.get_transaction(id).await?;
                (record.organization_id, record.metadata)
            }
            EntityKind::Step => {
                let record = self.store.get_transaction_line(id).await?;
                (record.organization_id, record.metadata)
            }
        };
        let status = metadata_str(&metadata, "status")
            .map(str::to_string)
            .ok_or_else(|| {
                EngineError::Model(playbook_types::Error::InvalidInput(format!(
                    "{kind} {id} has no status"
                )))
            })?;
        Ok(RecordState {
            organization_id,
            status,
        })
    }

    /// Merge `patch` into the metadata of a playbook, run or step.
    pub async fn patch_record(&self, kind: EntityKind, id: &str, patch: Metadata) -> Result<()> {
        match kind {
            EntityKind::Playbook => {
                self.store.update_entity(id, patch).await?;
            }
            EntityKind::Run => {
                self.store.update_transaction(id, patch).await?;
            }
            EntityKind::Step => {
                self.store.update_transaction_line(id, patch).await?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Audit records
    // ─────────────────────────────────────────────────────────────────────

    pub async fn append_transition(
        &self,
        organization_id: &str,
        transition: &TransitionRecord,
    ) -> Result<TransitionRecord> {
        let record = self
            .store
            .create_transaction(NewTransaction {
                organization_id: organization_id.to_string(),
                transaction_type: TXN_TRANSITION.to_string(),
                transaction_code: format!(
                    "{}-{}-{}",
                    transition.entity_kind, transition.from_state, transition.to_state
                ),
                smart_code: smart_code::transition(transition.entity_kind, &transition.to_state),
                reference_entity_id: Some(transition.entity_id.clone()),
                metadata: transition.to_metadata()?,
            })
            .await?;
        Ok(TransitionRecord::from_record(&record)?)
    }

    /// Audit trail of one record, oldest first.
    pub async fn transitions(&self, kind: EntityKind, id: &str) -> Result<Vec<TransitionRecord>> {
        let records = self
            .store
            .query_transactions(
                &RecordFilter::new()
                    .record_type(TXN_TRANSITION)
                    .parent(id)
                    .metadata_eq("entity_kind", kind.as_str()),
            )
            .await?;
        records
            .iter()
            .map(|r| Ok(TransitionRecord::from_record(r)?))
            .collect()
    }

    pub async fn create_human_task(
        &self,
        step: &StepExecution,
        title: &str,
        assignee: Option<&str>,
        due_at: Timestamp,
    ) -> Result<TransactionRecord> {
        let record = self
            .store
            .create_transaction(NewTransaction {
                organization_id: step.organization_id.clone(),
                transaction_type: TXN_HUMAN_TASK.to_string(),
                transaction_code: format!("TASK-{}", step.id),
                smart_code: smart_code::HUMAN_TASK.to_string(),
                reference_entity_id: Some(step.id.clone()),
                metadata: object(json!({
                    "status": "open",
                    "title": title,
                    "run_id": step.run_id,
                    "step_execution_id": step.id,
                    "assignee": assignee,
                    "inputs": step.inputs,
                    "due_at": due_at,
                })),
            })
            .await?;
        Ok(record)
    }

    /// Mark open tasks for a step as closed. Returns how many were closed.
    pub async fn close_human_tasks(&self, step_id: &str, closed_by: &str) -> Result<usize> {
        let open = self
            .store
            .query_transactions(
                &RecordFilter::new()
                    .record_type(TXN_HUMAN_TASK)
                    .parent(step_id)
                    .metadata_eq("status", "open"),
            )
            .await?;
        for task in &open {
            self.store
                .update_transaction(
                    &task.id,
                    object(json!({
                        "status": "completed",
                        "closed_by": closed_by,
                        "closed_at": playbook_types::now(),
                    })),
                )
                .await?;
        }
        Ok(open.len())
    }

    pub async fn human_tasks(&self, step_id: &str) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .store
            .query_transactions(&RecordFilter::new().record_type(TXN_HUMAN_TASK).parent(step_id))
            .await?)
    }

    pub async fn append_compliance(
        &self,
        organization_id: &str,
        run_id: &str,
        event: &str,
        payload: Value,
    ) -> Result<TransactionRecord> {
        let mut metadata = object(payload);
        metadata.insert("event".into(), Value::String(event.to_string()));
        metadata.insert("run_id".into(), Value::String(run_id.to_string()));
        metadata.insert("recorded_at".into(), json!(playbook_types::now()));
        let record = self
            .store
            .create_transaction(NewTransaction {
                organization_id: organization_id.to_string(),
                transaction_type: TXN_COMPLIANCE.to_string(),
                transaction_code: format!("COMPLIANCE-{event}"),
                smart_code: smart_code::COMPLIANCE_AUDIT.to_string(),
                reference_entity_id: Some(run_id.to_string()),
                metadata,
            })
            .await?;
        Ok(record)
    }

    pub async fn compliance_events(&self, run_id: &str) -> Result<Vec<TransactionRecord>> {
        Ok(self
            .store
            .query_transactions(&RecordFilter::new().record_type(TXN_COMPLIANCE).parent(run_id))
            .await?)
    }
}

/// Wrap a JSON object as metadata; anything else becomes `{"value": ...}`.
pub(crate) fn object(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        Value::Null => Metadata::new(),
        other => {
            let mut map = Metadata::new();
            map.insert("value".into(), other);
            map
        }
    }
}

fn require_draft(playbook: &PlaybookDefinition) -> Result<()> {
    if playbook.status != PlaybookStatus::Draft {
        return Err(EngineError::InvalidDefinition(format!(
            "playbook '{}' is {}; only draft playbooks can change",
            playbook.code, playbook.status
        )));
    }
    Ok(())
}

fn not_a(id: &str, kind: &str) -> EngineError {
    EngineError::Model(playbook_types::Error::NotFound(format!("{kind} {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_store::MemoryStore;
    use playbook_types::WorkerType;
    use std::sync::Arc;

    fn repo() -> PlaybookRepository {
        PlaybookRepository::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_steps_sorted_by_sequence() {
        let repo = repo();
        let pb = repo
            .create_playbook("org-1", "GRANT", "Grant intake", "")
            .await
            .unwrap();
        repo.add_step(&pb.id, StepDefinition::new("review", 2, WorkerType::Human))
            .await
            .unwrap();
        repo.add_step(&pb.id, StepDefinition::new("intake", 1, WorkerType::System))
            .await
            .unwrap();

        let steps = repo.steps(&pb.id).await.unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["intake", "review"]);
        assert_eq!(steps[0].playbook_id, pb.id);
    }

    #[tokio::test]
    async fn test_contracts_frozen_after_publish() {
        let repo = repo();
        let pb = repo.create_playbook("org-1", "PB", "PB", "").await.unwrap();
        let step = repo
            .add_step(&pb.id, StepDefinition::new("only", 1, WorkerType::Ai))
            .await
            .unwrap();
        repo.set_contract(&step.id, "input_contract", json!({"type": "object"}))
            .await
            .unwrap();

        repo.patch_record(EntityKind::Playbook, &pb.id, object(json!({"status": "published"})))
            .await
            .unwrap();

        let err = repo
            .set_contract(&pb.id, "input_contract", json!({"type": "object"}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
        assert!(
            repo.set_contract(&step.id, "output_contract", json!({}))
                .await
                .is_err()
        );
        assert!(
            repo.add_step(&pb.id, StepDefinition::new("late", 2, WorkerType::Ai))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_state_of_reads_status() {
        let repo = repo();
        let pb = repo.create_playbook("org-1", "PB", "PB", "").await.unwrap();
        let state = repo.state_of(EntityKind::Playbook, &pb.id).await.unwrap();
        assert_eq!(state.status, "draft");
        assert_eq!(state.organization_id, "org-1");

        let missing = repo.state_of(EntityKind::Run, "nope").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_human_task_open_and_close() {
        let repo = repo();
        let pb = repo.create_playbook("org-1", "PB", "PB", "").await.unwrap();
        let def = repo
            .add_step(&pb.id, StepDefinition::new("sign", 1, WorkerType::Human))
            .await
            .unwrap();
        let run = repo
            .create_run(&PlaybookRun {
                id: Id::new(),
                organization_id: "org-1".into(),
                playbook_id: pb.id.clone(),
                status: RunStatus::Queued,
                inputs: json!({}),
                outputs: None,
                priority: Default::default(),
                correlation_id: "c-1".into(),
                progress: Default::default(),
                cost: 0.0,
                ai_confidence: None,
                ai_insights: vec![],
                failure_reason: None,
                validation_errors: vec![],
                created_by: None,
                started_at: None,
                completed_at: None,
                blocked_at: None,
                escalate_at: None,
            })
            .await
            .unwrap();
        let step = repo
            .create_step_execution(&StepExecution::from_definition(
                &def,
                &run,
                StepStatus::Pending,
            ))
            .await
            .unwrap();

        repo.create_human_task(&step, "sign", Some("officer"), playbook_types::now())
            .await
            .unwrap();
        assert_eq!(repo.close_human_tasks(&step.id, "alice").await.unwrap(), 1);
        assert_eq!(repo.close_human_tasks(&step.id, "alice").await.unwrap(), 0);
        let tasks = repo.human_tasks(&step.id).await.unwrap();
        assert_eq!(metadata_str(&tasks[0].metadata, "status"), Some("completed"));
    }
}
