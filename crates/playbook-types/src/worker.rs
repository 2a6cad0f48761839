//! Worker strategies, step categories and scheduling priorities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The executor category for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    /// Task assigned to a person; completes out of band.
    Human,
    /// Model inference through the configured AI backend.
    Ai,
    /// Internal service call.
    System,
    /// Third-party API call.
    External,
}

impl WorkerType {
    pub const ALL: [WorkerType; 4] = [
        WorkerType::Human,
        WorkerType::Ai,
        WorkerType::System,
        WorkerType::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Human => "human",
            WorkerType::Ai => "ai",
            WorkerType::System => "system",
            WorkerType::External => "external",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(WorkerType::Human),
            "ai" => Ok(WorkerType::Ai),
            "system" => Ok(WorkerType::System),
            "external" => Ok(WorkerType::External),
            other => Err(Error::InvalidInput(format!("unknown worker type '{other}'"))),
        }
    }
}

/// Policy-relevant category of a step.
///
/// Committee reviews are subject to the quorum policy and decision steps to
/// the approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Standard,
    CommitteeReview,
    Decision,
}

/// Dispatch priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Coarse risk classification used by approval policies and insights.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Amount-based heuristic: above 75k is high, above 25k medium.
    pub fn from_amount(amount: f64) -> Self {
        if amount > 75_000.0 {
            RiskLevel::High
        } else if amount > 25_000.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_risk_from_amount() {
        assert_eq!(RiskLevel::from_amount(80_000.0), RiskLevel::High);
        assert_eq!(RiskLevel::from_amount(75_000.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_amount(25_000.0), RiskLevel::Low);
    }

    #[test]
    fn test_worker_type_parse() {
        for worker in WorkerType::ALL {
            assert_eq!(worker.as_str().parse::<WorkerType>().unwrap(), worker);
        }
        assert!("robot".parse::<WorkerType>().is_err());
    }
}
