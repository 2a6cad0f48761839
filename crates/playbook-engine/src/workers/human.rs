//! Human steps: open a task record and wait for an explicit completion.

use async_trait::async_trait;

use super::{StepWorker, WorkerOutcome};
use crate::dispatch::StepDispatch;
use crate::error::{EngineError, Result};
use crate::repository::PlaybookRepository;

pub struct HumanTaskWorker {
    repo: PlaybookRepository,
}

impl HumanTaskWorker {
    pub fn new(repo: PlaybookRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl StepWorker for HumanTaskWorker {
    async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome> {
        let due_at = playbook_types::after_secs(playbook_types::now(), dispatch.definition.sla_seconds)
            .ok_or_else(|| {
                EngineError::InvalidDefinition(format!(
                    "sla_seconds {} is out of range",
                    dispatch.definition.sla_seconds
                ))
            })?;
        let assignee = dispatch
            .step
            .assignee
            .clone()
            .or_else(|| dispatch.definition.assignee.clone());
        let title = if dispatch.definition.description.is_empty() {
            dispatch.definition.name.clone()
        } else {
            dispatch.definition.description.clone()
        };

        let mut step = dispatch.step.clone();
        step.inputs = dispatch.inputs.clone();
        let task = self
            .repo
            .create_human_task(&step, &title, assignee.as_deref(), due_at)
            .await?;
        tracing::info!(
            step_id = %dispatch.step.id,
            task_id = %task.id,
            assignee = assignee.as_deref().unwrap_or("unassigned"),
            due_at = %due_at,
            "Human task created"
        );
        Ok(WorkerOutcome::Waiting {
            assignee,
            due_at,
            task_id: task.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ExecutionContext;
    use playbook_store::MemoryStore;
    use playbook_types::{PlaybookRun, StepDefinition, StepExecution, StepStatus, WorkerType};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_creates_open_task_for_assignee() {
        let repo = PlaybookRepository::new(Arc::new(MemoryStore::new()));
        let mut definition = StepDefinition::new("approve", 3, WorkerType::Human);
        definition.assignee = Some("finance_manager".into());
        definition.sla_seconds = 7200;
        let run: PlaybookRun = serde_json::from_value(json!({
            "id": "run-1",
            "organization_id": "org-1",
            "playbook_id": "pb-1"
        }))
        .unwrap();
        let step = StepExecution::from_definition(&definition, &run, StepStatus::Running);
        let step_id = step.id.clone();
        let dispatch = StepDispatch {
            run,
            step,
            definition,
            inputs: json!({"amount": 1200}),
            context: ExecutionContext::default(),
            completed: Vec::new(),
        };

        let before = playbook_types::now();
        let outcome = HumanTaskWorker::new(repo.clone())
            .execute(&dispatch)
            .await
            .unwrap();
        let WorkerOutcome::Waiting {
            assignee, due_at, ..
        } = outcome
        else {
            panic!("expected a waiting outcome");
        };
        assert_eq!(assignee.as_deref(), Some("finance_manager"));
        assert!(due_at >= before + chrono::Duration::seconds(7200));

        let tasks = repo.human_tasks(&step_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].metadata["status"], json!("open"));
        assert_eq!(tasks[0].metadata["inputs"], json!({"amount": 1200}));
    }
}
