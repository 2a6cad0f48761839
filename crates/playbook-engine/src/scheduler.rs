//! Which steps may run now.
//!
//! Pure functions over a run's step executions; the orchestrator feeds them
//! fresh state on every poll.
//!
//! A step's prerequisites are the whole previous sequence group (steps that
//! share a sequence number run in parallel) plus every group named in
//! `depends_on`. A group is satisfied when all of its steps are completed or
//! skipped.

use std::cmp::Reverse;

use playbook_types::{StepExecution, StepStatus, Timestamp};

/// Whether every prerequisite group of `step` has settled.
pub fn prerequisites_met(step: &StepExecution, run_steps: &[StepExecution]) -> bool {
    let previous = run_steps
        .iter()
        .map(|s| s.sequence)
        .filter(|seq| *seq < step.sequence)
        .max();

    let mut groups: Vec<u32> = step.depends_on.clone();
    if let Some(previous) = previous {
        groups.push(previous);
    }
    groups.iter().all(|seq| group_settled(*seq, run_steps))
}

/// A missing group counts as unsettled.
fn group_settled(sequence: u32, run_steps: &[StepExecution]) -> bool {
    let mut members = run_steps.iter().filter(|s| s.sequence == sequence).peekable();
    members.peek().is_some() && members.all(|s| s.status.satisfies_prerequisite())
}

/// Pending, signalled, past its start time and past any retry delay.
pub fn is_executable(step: &StepExecution, run_steps: &[StepExecution], now: Timestamp) -> bool {
    step.status == StepStatus::Pending
        && step.signals_satisfied()
        && step.earliest_start_time.is_none_or(|t| t <= now)
        && step.retry_scheduled_at.is_none_or(|t| t <= now)
        && prerequisites_met(step, run_steps)
}

/// Queued steps whose prerequisites have settled.
pub fn unlockable<'a>(run_steps: &'a [StepExecution]) -> Vec<&'a StepExecution> {
    run_steps
        .iter()
        .filter(|s| s.status == StepStatus::Queued && prerequisites_met(s, run_steps))
        .collect()
}

/// Highest priority first, then lowest sequence, capped at `capacity`.
pub fn select(mut candidates: Vec<StepExecution>, capacity: usize) -> Vec<StepExecution> {
    candidates.sort_by_key(|s| (Reverse(s.priority), s.sequence));
    candidates.truncate(capacity);
    candidates
}
