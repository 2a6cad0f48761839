//! Lifecycle states for playbooks, runs and step executions.
//!
//! Status values are persisted as plain strings in each record's metadata, so
//! every enum round-trips through [`as_str`](RunStatus::as_str) and `FromStr`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The three kinds of record whose lifecycle the state machine governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Playbook,
    Run,
    Step,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Playbook => "playbook",
            EntityKind::Run => "run",
            EntityKind::Step => "step",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a playbook definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl PlaybookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybookStatus::Draft => "draft",
            PlaybookStatus::Published => "published",
            PlaybookStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for PlaybookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaybookStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PlaybookStatus::Draft),
            "published" => Ok(PlaybookStatus::Published),
            "archived" => Ok(PlaybookStatus::Archived),
            other => Err(unknown("playbook", other)),
        }
    }
}

/// Status of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Blocked => "blocked",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled runs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Runs that still hold resources and block archiving their playbook.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "in_progress" => Ok(RunStatus::InProgress),
            "blocked" => Ok(RunStatus::Blocked),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(unknown("run", other)),
        }
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Eligible for dispatch once prerequisites hold.
    #[default]
    Pending,
    /// Placeholder created at run start; not yet unlocked.
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    /// A human step paused for more data.
    WaitingInput,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::WaitingInput => "waiting_input",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether a step in this state lets its dependents proceed.
    pub fn satisfies_prerequisite(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "queued" => Ok(StepStatus::Queued),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "waiting_input" => Ok(StepStatus::WaitingInput),
            other => Err(unknown("step", other)),
        }
    }
}

fn unknown(kind: &str, value: &str) -> Error {
    Error::UnknownState {
        kind: kind.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::Blocked,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_step_status_serde_matches_as_str() {
        let json = serde_json::to_value(StepStatus::WaitingInput).unwrap();
        assert_eq!(json, serde_json::json!("waiting_input"));
        assert_eq!(
            "waiting_input".parse::<StepStatus>().unwrap(),
            StepStatus::WaitingInput
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Blocked.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::WaitingInput.is_terminal());
    }

    #[test]
    fn test_prerequisite_states() {
        assert!(StepStatus::Completed.satisfies_prerequisite());
        assert!(StepStatus::Skipped.satisfies_prerequisite());
        assert!(!StepStatus::Failed.satisfies_prerequisite());
        assert!(!StepStatus::Running.satisfies_prerequisite());
    }

    #[test]
    fn test_unknown_state_error() {
        let err = "paused".parse::<RunStatus>().unwrap_err();
        assert!(err.to_string().contains("paused"));
    }
}
