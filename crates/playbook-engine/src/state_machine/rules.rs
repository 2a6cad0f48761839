//! The default transition table and its guards and post-actions.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use playbook_contracts::{INPUT_CONTRACT, OUTPUT_CONTRACT};
use playbook_types::{
    EngineEvent, EntityKind, PlaybookStatus, RunStatus, StepDefinition, StepStatus, Timestamp,
};

use super::{
    GuardVerdict, PostAction, StateMachine, TransitionContext, TransitionGuard, TransitionRequest,
    TransitionRule, is_published,
};
use crate::error::Result;

/// The engine's built-in transition table.
pub fn default_rules() -> Vec<TransitionRule> {
    use EntityKind::{Playbook, Run, Step};

    vec![
        // ── Playbooks ─────────────────────────────────────────────────
        TransitionRule::new(Playbook, &["draft"], "published")
            .guard(ContractsPresent)
            .guard(StepsWellFormed)
            .guard(ContractsWellFormed),
        TransitionRule::new(Playbook, &["published"], "archived")
            .guard(NoActiveRuns)
            .then(CancelActiveRuns),
        // ── Runs ──────────────────────────────────────────────────────
        TransitionRule::new(Run, &["queued"], "in_progress")
            .guard(PlaybookPublished)
            .guard(RunInputsValid)
            .guard(CapacityAvailable),
        TransitionRule::new(Run, &["in_progress"], "blocked").then(StartEscalationTimer),
        TransitionRule::new(Run, &["blocked"], "in_progress").then(ClearEscalationTimer),
        TransitionRule::new(Run, &["in_progress"], "completed")
            .guard(AllStepsSettled)
            .guard(RunOutputsValid)
            .then(EmitRunCompleted),
        TransitionRule::new(Run, &["in_progress", "blocked"], "failed")
            .then(SkipOpenSteps)
            .then(EmitRunFailed),
        TransitionRule::new(Run, &["queued", "in_progress", "blocked"], "cancelled")
            .then(SkipOpenSteps),
        // ── Steps ─────────────────────────────────────────────────────
        TransitionRule::new(Step, &["queued"], "pending"),
        TransitionRule::new(Step, &["pending"], "running")
            .guard(StepInputValid)
            .guard(WorkerObtainable)
            .guard(WithinSlaWindow),
        TransitionRule::new(Step, &["running"], "waiting_input").then(PauseTimer),
        TransitionRule::new(Step, &["waiting_input"], "running").then(ResumeTimer),
        TransitionRule::new(Step, &["running"], "completed")
            .guard(StepOutputValid)
            .guard(NoDisallowedSideEffects)
            .then(EmitStepCompleted),
        TransitionRule::new(Step, &["running", "pending", "waiting_input"], "failed")
            .then(EmitStepFailed)
            .then(ApplyRetryPolicy),
        TransitionRule::new(Step, &["failed"], "pending"),
        TransitionRule::new(
            Step,
            &["pending", "queued", "running", "waiting_input"],
            "skipped",
        ),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Playbook guards
// ─────────────────────────────────────────────────────────────────────────────

struct ContractsPresent;

#[async_trait]
impl TransitionGuard for ContractsPresent {
    fn name(&self) -> &str {
        "contracts_present"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let repo = machine.repo();
        let mut missing = Vec::new();
        for field in [INPUT_CONTRACT, OUTPUT_CONTRACT] {
            if repo.contract(&req.entity_id, field).await?.is_none() {
                missing.push(field);
            }
        }
        if missing.is_empty() {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "missing {}",
                missing.join(" and ")
            )))
        }
    }
}

/// At least one step, every `depends_on` names an earlier sequence, and
/// every step's time offsets can be added to a timestamp.
struct StepsWellFormed;

#[async_trait]
impl TransitionGuard for StepsWellFormed {
    fn name(&self) -> &str {
        "steps_well_formed"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let steps = machine.repo().steps(&req.entity_id).await?;
        if steps.is_empty() {
            return Ok(GuardVerdict::reject("playbook has no steps"));
        }
        let now = playbook_types::now();
        for step in &steps {
            if let Some(field) = out_of_range_offset(step, now) {
                return Ok(GuardVerdict::reject(format!(
                    "step '{}' has an out-of-range {field}",
                    step.name
                )));
            }
            for dep in &step.depends_on {
                if *dep >= step.sequence || !steps.iter().any(|s| s.sequence == *dep) {
                    return Ok(GuardVerdict::reject(format!(
                        "step '{}' depends on unknown or later sequence {dep}",
                        step.name
                    )));
                }
            }
        }
        Ok(GuardVerdict::Allow)
    }
}

fn out_of_range_offset(step: &StepDefinition, now: Timestamp) -> Option<&'static str> {
    let fits = |secs: u64| playbook_types::after_secs(now, secs).is_some();
    if !fits(step.sla_seconds) {
        return Some("sla_seconds");
    }
    if step.earliest_start_offset_secs.is_some_and(|secs| !fits(secs)) {
        return Some("earliest_start_offset_secs");
    }
    if let Some(policy) = &step.retry_policy
        && !policy.backoff_seconds.iter().all(|&secs| fits(secs))
    {
        return Some("retry backoff");
    }
    None
}

struct ContractsWellFormed;

#[async_trait]
impl TransitionGuard for ContractsWellFormed {
    fn name(&self) -> &str {
        "contracts_well_formed"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let repo = machine.repo();
        let mut owners = vec![(req.entity_id.clone(), "playbook".to_string())];
        for step in repo.steps(&req.entity_id).await? {
            owners.push((step.id.clone(), format!("step '{}'", step.name)));
        }

        let mut problems = Vec::new();
        for (owner_id, label) in owners {
            for field in [INPUT_CONTRACT, OUTPUT_CONTRACT] {
                let Some(stored) = repo.contract(&owner_id, field).await? else {
                    continue;
                };
                let schema = match stored {
                    Value::String(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(schema) => schema,
                        Err(e) => {
                            problems.push(format!("{label} {field}: {e}"));
                            continue;
                        }
                    },
                    other => other,
                };
                if let Err(e) = machine.contracts().check_schema(&schema) {
                    problems.push(format!("{label} {field}: {e}"));
                }
            }
        }
        if problems.is_empty() {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(problems.join("; ")))
        }
    }
}

struct NoActiveRuns;

#[async_trait]
impl TransitionGuard for NoActiveRuns {
    fn name(&self) -> &str {
        "no_active_runs"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let active = machine
            .repo()
            .runs_for_playbook(&req.entity_id)
            .await?
            .into_iter()
            .filter(|r| r.status.is_active())
            .count();
        if active == 0 {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::overridable(
                format!("playbook has {active} active run(s)"),
                format!("{active} active run(s) will be cancelled"),
            ))
        }
    }
}

struct CancelActiveRuns;

#[async_trait]
impl PostAction for CancelActiveRuns {
    fn name(&self) -> &str {
        "cancel_active_runs"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        if !req.context.force {
            return Ok(());
        }
        let runs = machine.repo().runs_for_playbook(&req.entity_id).await?;
        for run in runs.into_iter().filter(|r| r.status.is_active()) {
            machine
                .transition(
                    EntityKind::Run,
                    &run.id,
                    RunStatus::Cancelled.as_str(),
                    TransitionContext::new()
                        .by(req.context.actor.clone())
                        .because("playbook archived"),
                )
                .await?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run guards and actions
// ─────────────────────────────────────────────────────────────────────────────

struct PlaybookPublished;

#[async_trait]
impl TransitionGuard for PlaybookPublished {
    fn name(&self) -> &str {
        "playbook_published"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let run = machine.repo().get_run(&req.entity_id).await?;
        let state = machine
            .repo()
            .state_of(EntityKind::Playbook, &run.playbook_id)
            .await?;
        if is_published(&state.status) {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "playbook is {}, not {}",
                state.status,
                PlaybookStatus::Published
            )))
        }
    }
}

struct RunInputsValid;

#[async_trait]
impl TransitionGuard for RunInputsValid {
    fn name(&self) -> &str {
        "run_inputs_valid"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let run = machine.repo().get_run(&req.entity_id).await?;
        let result = machine
            .contracts()
            .validate_playbook_input(&run.playbook_id, &run.inputs)
            .await;
        if result.valid {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "inputs violate the input contract: {}",
                result.error_messages().join("; ")
            )))
        }
    }
}

struct CapacityAvailable;

#[async_trait]
impl TransitionGuard for CapacityAvailable {
    fn name(&self) -> &str {
        "capacity_available"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let Some(limit) = machine.settings().max_active_runs else {
            return Ok(GuardVerdict::Allow);
        };
        let repo = machine.repo();
        let active = repo
            .runs_with_status(&req.organization_id, RunStatus::InProgress)
            .await?
            .len()
            + repo
                .runs_with_status(&req.organization_id, RunStatus::Blocked)
                .await?
                .len();
        if active < limit {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::overridable(
                format!("{active} of {limit} run slots in use"),
                format!("started over the limit of {limit} active runs"),
            ))
        }
    }
}

struct StartEscalationTimer;

#[async_trait]
impl PostAction for StartEscalationTimer {
    fn name(&self) -> &str {
        "start_escalation_timer"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let escalate_at = playbook_types::now().checked_add_signed(machine.settings().escalation_after);
        machine
            .repo()
            .update_run(
                &req.entity_id,
                object([("escalate_at", json!(escalate_at))]),
            )
            .await
    }
}

struct ClearEscalationTimer;

#[async_trait]
impl PostAction for ClearEscalationTimer {
    fn name(&self) -> &str {
        "clear_escalation_timer"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        machine
            .repo()
            .update_run(
                &req.entity_id,
                object([("escalate_at", Value::Null), ("blocked_at", Value::Null)]),
            )
            .await
    }
}

/// Completion requires every step to be completed or skipped.
struct AllStepsSettled;

#[async_trait]
impl TransitionGuard for AllStepsSettled {
    fn name(&self) -> &str {
        "all_steps_settled"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let steps = machine.repo().run_steps(&req.entity_id).await?;
        let open: Vec<String> = steps
            .iter()
            .filter(|s| !s.status.satisfies_prerequisite())
            .map(|s| format!("'{}' is {}", s.name, s.status))
            .collect();
        if steps.is_empty() {
            Ok(GuardVerdict::reject("run has no steps"))
        } else if open.is_empty() {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "steps not finished: {}",
                open.join(", ")
            )))
        }
    }
}

struct RunOutputsValid;

#[async_trait]
impl TransitionGuard for RunOutputsValid {
    fn name(&self) -> &str {
        "run_outputs_valid"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let run = machine.repo().get_run(&req.entity_id).await?;
        let outputs = req
            .context
            .data_field("outputs")
            .cloned()
            .or(run.outputs)
            .unwrap_or(Value::Null);
        let result = machine
            .contracts()
            .validate_playbook_output(&run.playbook_id, &outputs)
            .await;
        if result.valid {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "outputs violate the output contract: {}",
                result.error_messages().join("; ")
            )))
        }
    }
}

struct EmitRunCompleted;

#[async_trait]
impl PostAction for EmitRunCompleted {
    fn name(&self) -> &str {
        "emit_run_completed"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        machine.emit(EngineEvent::RunCompleted {
            run_id: req.entity_id.clone(),
        });
        Ok(())
    }
}

/// Mark every step that has not finished as skipped.
struct SkipOpenSteps;

#[async_trait]
impl PostAction for SkipOpenSteps {
    fn name(&self) -> &str {
        "skip_open_steps"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let steps = machine.repo().run_steps(&req.entity_id).await?;
        for step in steps.iter().filter(|s| !s.status.is_terminal()) {
            machine
                .transition(
                    EntityKind::Step,
                    &step.id,
                    StepStatus::Skipped.as_str(),
                    TransitionContext::new()
                        .by(req.context.actor.clone())
                        .because(format!("run {}", req.to)),
                )
                .await?;
        }
        Ok(())
    }
}

struct EmitRunFailed;

#[async_trait]
impl PostAction for EmitRunFailed {
    fn name(&self) -> &str {
        "emit_run_failed"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        machine.emit(EngineEvent::RunFailed {
            run_id: req.entity_id.clone(),
            reason: req
                .context
                .reason
                .clone()
                .unwrap_or_else(|| "run failed".to_string()),
        });
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Step guards and actions
// ─────────────────────────────────────────────────────────────────────────────

struct StepInputValid;

#[async_trait]
impl TransitionGuard for StepInputValid {
    fn name(&self) -> &str {
        "step_input_valid"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        let inputs = req
            .context
            .data_field("inputs")
            .cloned()
            .unwrap_or(step.inputs);
        let result = machine
            .contracts()
            .validate_step_input(&step.step_id, &inputs)
            .await;
        if result.valid {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "inputs violate the step input contract: {}",
                result.error_messages().join("; ")
            )))
        }
    }
}

struct WorkerObtainable;

#[async_trait]
impl TransitionGuard for WorkerObtainable {
    fn name(&self) -> &str {
        "worker_obtainable"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let Some(workers) = machine.workers() else {
            return Ok(GuardVerdict::Allow);
        };
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        if workers.contains(step.worker_type) {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "no {} worker registered",
                step.worker_type
            )))
        }
    }
}

struct WithinSlaWindow;

#[async_trait]
impl TransitionGuard for WithinSlaWindow {
    fn name(&self) -> &str {
        "within_sla_window"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        match step.due_at {
            Some(due_at) if due_at < playbook_types::now() => Ok(GuardVerdict::reject(format!(
                "SLA window closed at {}",
                due_at.to_rfc3339()
            ))),
            _ => Ok(GuardVerdict::Allow),
        }
    }
}

struct PauseTimer;

#[async_trait]
impl PostAction for PauseTimer {
    fn name(&self) -> &str {
        "pause_timer"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        machine
            .repo()
            .update_step_execution(
                &req.entity_id,
                object([("paused_at", json!(playbook_types::now()))]),
            )
            .await
    }
}

/// Push the due date back by the time spent paused.
struct ResumeTimer;

#[async_trait]
impl PostAction for ResumeTimer {
    fn name(&self) -> &str {
        "resume_timer"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let repo = machine.repo();
        let step = repo.get_step_execution(&req.entity_id).await?;
        let mut patch = object([("paused_at", Value::Null)]);
        if let (Some(paused_at), Some(due_at)) = (step.paused_at, step.due_at) {
            let paused_for = playbook_types::now() - paused_at;
            patch.insert("due_at".into(), json!(due_at + paused_for));
        }
        repo.update_step_execution(&req.entity_id, patch).await
    }
}

struct StepOutputValid;

#[async_trait]
impl TransitionGuard for StepOutputValid {
    fn name(&self) -> &str {
        "step_output_valid"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        let outputs = req
            .context
            .data_field("outputs")
            .cloned()
            .or(step.outputs)
            .unwrap_or(Value::Null);
        let result = machine
            .contracts()
            .validate_step_output(&step.step_id, &outputs)
            .await;
        if result.valid {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "outputs violate the step output contract: {}",
                result.error_messages().join("; ")
            )))
        }
    }
}

struct NoDisallowedSideEffects;

#[async_trait]
impl TransitionGuard for NoDisallowedSideEffects {
    fn name(&self) -> &str {
        "no_disallowed_side_effects"
    }

    async fn check(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<GuardVerdict> {
        let reported: Vec<&str> = req
            .context
            .data_field("side_effects")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if reported.is_empty() {
            return Ok(GuardVerdict::Allow);
        }
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        let definition = machine.repo().get_step_definition(&step.step_id).await?;
        let Some(allowed) = definition.allowed_side_effects else {
            return Ok(GuardVerdict::Allow);
        };
        let disallowed: Vec<&str> = reported
            .into_iter()
            .filter(|effect| !allowed.iter().any(|a| a == effect))
            .collect();
        if disallowed.is_empty() {
            Ok(GuardVerdict::Allow)
        } else {
            Ok(GuardVerdict::reject(format!(
                "disallowed side effects: {}",
                disallowed.join(", ")
            )))
        }
    }
}

struct EmitStepCompleted;

#[async_trait]
impl PostAction for EmitStepCompleted {
    fn name(&self) -> &str {
        "emit_step_completed"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        machine.emit(EngineEvent::StepCompleted {
            step_id: step.id,
            run_id: step.run_id,
            outputs: step.outputs.unwrap_or(Value::Null),
        });
        Ok(())
    }
}

struct EmitStepFailed;

#[async_trait]
impl PostAction for EmitStepFailed {
    fn name(&self) -> &str {
        "emit_step_failed"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let step = machine.repo().get_step_execution(&req.entity_id).await?;
        let error = step
            .error
            .map(|e| format!("[{}] {}", e.code, e.message))
            .or_else(|| req.context.reason.clone())
            .unwrap_or_else(|| "step failed".to_string());
        machine.emit(EngineEvent::StepFailed {
            step_id: step.id,
            run_id: step.run_id,
            error,
            attempt: step.attempt,
        });
        Ok(())
    }
}

/// Requeue a failed step while its retry budget lasts; otherwise leave it
/// failed, failing the run too when the step is critical.
///
/// `data.retryable = false` marks failures that retrying cannot fix.
struct ApplyRetryPolicy;

#[async_trait]
impl PostAction for ApplyRetryPolicy {
    fn name(&self) -> &str {
        "apply_retry_policy"
    }

    async fn run(&self, machine: &StateMachine, req: &TransitionRequest) -> Result<()> {
        let repo = machine.repo();
        let step = repo.get_step_execution(&req.entity_id).await?;
        let definition = repo.get_step_definition(&step.step_id).await?;
        let settings = machine.settings();
        let policy = definition
            .retry_policy
            .clone()
            .unwrap_or_else(|| settings.default_retry.clone());
        let retryable = req
            .context
            .data_field("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let retry_at = (retryable && policy.should_retry(step.attempt)).then(|| {
            let backoff = policy.backoff_for(step.attempt, settings.fallback_backoff_secs);
            playbook_types::after_secs(playbook_types::now(), backoff.as_secs())
        });
        if let Some(None) = retry_at {
            warn!(step_id = %step.id, attempt = step.attempt, "Retry backoff out of range");
        }
        if let Some(Some(retry_at)) = retry_at {
            info!(
                step_id = %step.id,
                attempt = step.attempt,
                max_attempts = policy.max_attempts,
                retry_at = %retry_at,
                "Scheduling step retry"
            );
            machine
                .transition(
                    EntityKind::Step,
                    &step.id,
                    StepStatus::Pending.as_str(),
                    TransitionContext::new()
                        .by("retry_policy")
                        .because(format!("retry {} of {}", step.attempt, policy.max_attempts))
                        .with_patch("retry_scheduled_at", json!(retry_at))
                        .with_patch("due_at", Value::Null)
                        .with_patch("claimed_by", Value::Null),
                )
                .await?;
            return Ok(());
        }

        debug!(step_id = %step.id, attempt = step.attempt, "Step failed terminally");
        if step.critical {
            let run_state = repo.state_of(EntityKind::Run, &step.run_id).await?;
            let active = run_state
                .status
                .parse::<RunStatus>()
                .map(|s| s.is_active() && s != RunStatus::Queued)
                .unwrap_or(false);
            if active {
                let detail = step
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "failed".to_string());
                machine
                    .transition(
                        EntityKind::Run,
                        &step.run_id,
                        RunStatus::Failed.as_str(),
                        TransitionContext::new()
                            .by("retry_policy")
                            .because(format!("critical step '{}' failed: {detail}", step.name))
                            .with_patch(
                                "failure_reason",
                                format!("critical step '{}' failed: {detail}", step.name),
                            ),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn object<const N: usize>(entries: [(&str, Value); N]) -> playbook_types::Metadata {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
