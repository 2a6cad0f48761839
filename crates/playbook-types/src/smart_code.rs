//! Smart codes tagging every persisted record.
//!
//! Smart codes classify records for audit and traceability only; the engine
//! never branches on them.

use crate::status::EntityKind;

pub const PLAYBOOK_DEFINITION: &str = "PLAYBOOK.DEFINITION.CORE.v1";
pub const STEP_DEFINITION: &str = "PLAYBOOK.STEP.DEFINITION.v1";
pub const HAS_STEP: &str = "PLAYBOOK.REL.HAS_STEP.v1";
pub const PLAYBOOK_RUN: &str = "PLAYBOOK.RUN.INSTANCE.v1";
pub const STEP_EXECUTION: &str = "PLAYBOOK.STEP.EXECUTION.v1";
pub const HUMAN_TASK: &str = "PLAYBOOK.TASK.HUMAN.v1";
pub const COMPLIANCE_AUDIT: &str = "PLAYBOOK.COMPLIANCE.AUDIT.v1";

/// Pattern every well-formed smart code matches.
pub const SMART_CODE_PATTERN: &str = r"^[A-Z][A-Z0-9]*(\.[A-Z0-9_]+){2,}\.v[0-9]+$";

/// Entity type for playbook definitions.
pub const ENTITY_PLAYBOOK: &str = "playbook_definition";
/// Entity type for step definitions.
pub const ENTITY_STEP: &str = "playbook_step";
/// Transaction type for runs.
pub const TXN_RUN: &str = "playbook_run";
/// Transaction type for state transition audit entries.
pub const TXN_TRANSITION: &str = "state_transition";
/// Transaction type for human task assignments.
pub const TXN_HUMAN_TASK: &str = "human_task";
/// Transaction type for compliance audit events.
pub const TXN_COMPLIANCE: &str = "compliance_audit";
/// Line type for step executions.
pub const LINE_STEP: &str = "step_execution";
/// Relationship type from playbook to its steps.
pub const REL_HAS_STEP: &str = "has_step";

/// Smart code for a state transition audit record, e.g.
/// `PLAYBOOK.RUN.TRANSITION.IN_PROGRESS.v1`.
pub fn transition(kind: EntityKind, to_state: &str) -> String {
    format!(
        "PLAYBOOK.{}.TRANSITION.{}.v1",
        kind.as_str().to_uppercase(),
        to_state.to_uppercase()
    )
}
