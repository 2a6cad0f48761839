//! Compliance audit trail.
//!
//! Events are stored as `compliance_event` transactions parented to the run.
//! Writing them is best-effort: a failed write is logged and swallowed so
//! auditing never fails the workflow it observes.

use serde_json::Value;
use tracing::{debug, warn};

use playbook_types::TransactionRecord;

use crate::error::Result;
use crate::repository::PlaybookRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceEvent {
    RunStarted,
    StepExecuted,
    /// A human step is waiting; it is audited again as executed when done.
    StepAwaitingInput,
    RunCompleted,
    /// Final outputs failed the output contract.
    RunRejected,
    RunFailed,
}

impl ComplianceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceEvent::RunStarted => "run_started",
            ComplianceEvent::StepExecuted => "step_executed",
            ComplianceEvent::StepAwaitingInput => "step_awaiting_input",
            ComplianceEvent::RunCompleted => "run_completed",
            ComplianceEvent::RunRejected => "run_rejected",
            ComplianceEvent::RunFailed => "run_failed",
        }
    }
}

impl std::fmt::Display for ComplianceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ComplianceAuditor {
    repo: PlaybookRepository,
}

impl ComplianceAuditor {
    pub fn new(repo: PlaybookRepository) -> Self {
        Self { repo }
    }

    /// Append an event. Returns whether it was written.
    pub async fn record(
        &self,
        organization_id: &str,
        run_id: &str,
        event: ComplianceEvent,
        payload: Value,
    ) -> bool {
        match self
            .repo
            .append_compliance(organization_id, run_id, event.as_str(), payload)
            .await
        {
            Ok(record) => {
                debug!(run_id, event = %event, record_id = %record.id, "Compliance event recorded");
                true
            }
            Err(e) => {
                warn!(run_id, event = %event, error = %e, "Failed to record compliance event");
                false
            }
        }
    }

    /// Events for a run, oldest first.
    pub async fn events(&self, run_id: &str) -> Result<Vec<TransactionRecord>> {
        self.repo.compliance_events(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_events_are_listed_per_run() {
        let auditor = ComplianceAuditor::new(PlaybookRepository::new(Arc::new(MemoryStore::new())));
        assert!(
            auditor
                .record("org-1", "run-1", ComplianceEvent::RunStarted, json!({"score": 100}))
                .await
        );
        auditor
            .record("org-1", "run-1", ComplianceEvent::StepExecuted, json!({"step": "a"}))
            .await;
        auditor
            .record("org-1", "run-2", ComplianceEvent::RunStarted, json!({}))
            .await;

        let events = auditor.events("run-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].metadata["event"], json!("run_started"));
        assert_eq!(events[0].metadata["score"], json!(100));
        assert_eq!(events[1].metadata["event"], json!("step_executed"));
    }
}
