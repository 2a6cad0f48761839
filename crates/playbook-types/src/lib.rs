//! Shared types for the playbook orchestration engine.
//!
//! Everything the engine persists is a generic record (entity, transaction,
//! transaction line, relationship) tagged with a smart code and carrying a
//! free-form metadata bag. The typed views in [`model`] impose the logical
//! playbook/run/step model on top of those records.

pub mod error;
pub mod event;
pub mod model;
pub mod record;
pub mod smart_code;
pub mod status;
pub mod worker;

pub use error::{Error, Result};
pub use event::{EngineEvent, Signal, SignalType};
pub use model::{
    AiStepSettings, PlaybookDefinition, PlaybookRun, RetryPolicy, RunProgress, StepDefinition,
    StepError, StepExecution, TransitionRecord,
};
pub use record::{
    EntityRecord, Metadata, NewEntity, NewRelationship, NewTransaction, NewTransactionLine,
    RelationshipRecord, TransactionLineRecord, TransactionRecord,
};
pub use status::{EntityKind, PlaybookStatus, RunStatus, StepStatus};
pub use worker::{Priority, RiskLevel, StepType, WorkerType};

/// Identifier used for every persisted record.
pub type Id = String;

/// UTC timestamp used across the engine.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh record identifier.
pub fn new_id() -> Id {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC time.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// `from` plus `secs` seconds, or `None` when the result falls outside the
/// representable range.
pub fn after_secs(from: Timestamp, secs: u64) -> Option<Timestamp> {
    let secs = i64::try_from(secs).ok()?;
    from.checked_add_signed(chrono::TimeDelta::try_seconds(secs)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_secs_rejects_unrepresentable_offsets() {
        let start = now();
        assert_eq!(
            after_secs(start, 90),
            Some(start + chrono::TimeDelta::seconds(90))
        );
        assert_eq!(after_secs(start, 10_000_000_000_000), None);
        assert_eq!(after_secs(start, u64::MAX), None);
    }
}
