//! Contract and policy enforcement around the orchestrator.
//!
//! ```text
//! ContractAwareOrchestrator
//!   start_run ──► playbook input contract ─► approval policy ─► Orchestrator::start_run
//!   execute_step ─► Orchestrator::process_step
//!                     └─ ContractGate (installed as middleware, also gates the poll loop)
//!                          before_dispatch: step input contract, SLA, segregation,
//!                                           quorum (committee review), approval (decision)
//!                          after_dispatch:  step output contract
//!                          step_finished:   score the step, audit step_executed
//!                                           (step_awaiting_input while a person works)
//!   complete_run ─► Orchestrator::complete_run
//!                     └─ ContractGate::before_run_completion: playbook output contract
//! ```
//!
//! Contract failures always block. Policy failures block at or above the
//! gate's blocking severity and are reported as warnings below it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use playbook_contracts::{
    ApprovalContext, ContractValidationService, PolicyResult, QuorumContext, SegregationContext,
    RunMetrics, Severity, SlaContext, ValidationMetrics, ValidationResult,
};
use playbook_types::{
    Id, PlaybookRun, RiskLevel, RunStatus, StepError, StepStatus, StepType, TransactionRecord,
};

use crate::audit::{ComplianceAuditor, ComplianceEvent};
use crate::dispatch::{ExecutionContext, StepDispatch};
use crate::error::{EngineError, Result};
use crate::middleware::{PreDispatch, ValidationMiddleware, Verdict};
use crate::orchestrator::{Orchestrator, RunOptions, StepReport};
use crate::repository::PlaybookRepository;

/// Result of [`ContractAwareOrchestrator::execute_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepExecutionResult {
    pub step_id: Id,
    pub status: StepStatus,
    pub outputs: Option<Value>,
    pub policy_violations: Vec<String>,
    pub validation_warnings: Vec<String>,
    /// The run's compliance score after this step: the mean of its step
    /// scores so far.
    pub compliance_score: u8,
    pub error: Option<StepError>,
}

/// Result of [`ContractAwareOrchestrator::complete_run`].
#[derive(Debug, Clone)]
pub struct RunCompletionResult {
    pub success: bool,
    pub run: PlaybookRun,
    /// The output contract check; absent when the run never got that far.
    pub validation_results: Option<ValidationResult>,
}

#[derive(Debug, Default)]
struct PreCheck {
    blocking: Vec<String>,
    warnings: Vec<String>,
    inputs: Option<Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ContractGate
// ─────────────────────────────────────────────────────────────────────────────

/// Validation middleware carrying per-run compliance metrics.
///
/// Metrics stay in memory for the life of the gate; [`ContractGate::forget`]
/// drops a run's entry.
pub struct ContractGate {
    contracts: Arc<ContractValidationService>,
    auditor: ComplianceAuditor,
    block_at: Severity,
    runs: RwLock<HashMap<Id, RunMetrics>>,
    /// Metrics of steps between pre-dispatch and their final step_finished.
    in_flight: Mutex<HashMap<Id, ValidationMetrics>>,
    /// Latest output contract check per run.
    output_checks: Mutex<HashMap<Id, ValidationResult>>,
}

impl ContractGate {
    pub fn new(contracts: Arc<ContractValidationService>, repo: PlaybookRepository) -> Self {
        Self {
            contracts,
            auditor: ComplianceAuditor::new(repo),
            block_at: Severity::Error,
            runs: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            output_checks: Mutex::new(HashMap::new()),
        }
    }

    /// Lowest policy severity that blocks a step. Defaults to `Error`.
    pub fn with_block_at(mut self, severity: Severity) -> Self {
        self.block_at = severity;
        self
    }

    pub fn auditor(&self) -> &ComplianceAuditor {
        &self.auditor
    }

    pub fn metrics(&self, run_id: &str) -> Option<RunMetrics> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn compliance_score(&self, run_id: &str) -> Option<u8> {
        self.runs.read().get(run_id).map(RunMetrics::compliance_score)
    }

    pub fn forget(&self, run_id: &str) {
        self.runs.write().remove(run_id);
        self.output_checks.lock().remove(run_id);
    }

    fn record_run_checks(&self, run_id: &str, metrics: ValidationMetrics) {
        self.runs
            .write()
            .entry(run_id.to_string())
            .or_default()
            .record_run_checks(metrics);
    }

    fn record_step(&self, run_id: &str, metrics: ValidationMetrics) -> u8 {
        self.runs
            .write()
            .entry(run_id.to_string())
            .or_default()
            .record_step(metrics)
    }

    fn weigh(&self, result: &PolicyResult, check: &mut PreCheck) {
        if result.compliant {
            return;
        }
        let line = format!("[{}] {}", result.policy, result.message);
        if result.severity >= self.block_at {
            check.blocking.push(line);
        } else {
            check.warnings.push(line);
        }
    }

    async fn pre_validate(&self, dispatch: &StepDispatch) -> (PreCheck, ValidationMetrics) {
        let mut check = PreCheck::default();
        let mut metrics = ValidationMetrics::new();
        let step_name = dispatch.definition.name.clone();
        let playbook_id = dispatch.run.playbook_id.as_str();
        let context = &dispatch.context;

        let input = self
            .contracts
            .validate_step_input(&dispatch.definition.id, &dispatch.inputs)
            .await;
        metrics.record_contract(format!("step_input:{step_name}"), &input);
        if input.valid {
            check.inputs = input.validated_data.clone();
        } else {
            check.blocking.extend(
                input
                    .error_messages()
                    .into_iter()
                    .map(|m| format!("[input_contract] {m}")),
            );
        }

        let mut results = vec![
            self.contracts
                .validate_sla_policy(
                    playbook_id,
                    &SlaContext {
                        step_name: Some(step_name.clone()),
                        start_time: dispatch.run.started_at.unwrap_or_else(playbook_types::now),
                        current_time: None,
                        business_hours_only: context.business_hours_only,
                    },
                )
                .await,
        ];

        if let Some(actor) = &context.actor {
            results.push(
                self.contracts
                    .validate_segregation_policy(
                        playbook_id,
                        &SegregationContext {
                            step_name: step_name.clone(),
                            current_user_id: actor.user_id.clone(),
                            current_user_roles: actor.roles.clone(),
                            previous_step_users: dispatch.previous_step_users(),
                            relationship_checks: context.relationship_checks.clone(),
                        },
                    )
                    .await,
            );
        }

        match dispatch.definition.step_type {
            StepType::CommitteeReview => results.push(
                self.contracts
                    .validate_quorum_policy(
                        playbook_id,
                        &QuorumContext {
                            step_name: Some(step_name.clone()),
                            voters: context.voters.clone(),
                            voting_window_start: context.voting_window_start,
                            current_time: None,
                            conflict_checks: context.conflict_checks.clone(),
                        },
                    )
                    .await,
            ),
            StepType::Decision => results.push(
                self.contracts
                    .validate_approval_policy(playbook_id, &approval_context(context))
                    .await,
            ),
            StepType::Standard => {}
        }

        for result in results {
            self.weigh(&result, &mut check);
            metrics.record_policy(result);
        }
        (check, metrics)
    }
}

fn approval_context(context: &ExecutionContext) -> ApprovalContext {
    ApprovalContext {
        amount: context.amount,
        risk_level: Some(
            context
                .effective_risk()
                .unwrap_or_else(|| RiskLevel::from_amount(0.0)),
        ),
        approvers: context.approvers.clone(),
        special_circumstances: context.special_circumstances.clone(),
    }
}

#[async_trait]
impl ValidationMiddleware for ContractGate {
    fn name(&self) -> &str {
        "contract_gate"
    }

    async fn before_dispatch(&self, dispatch: &StepDispatch) -> Result<PreDispatch> {
        let (check, metrics) = self.pre_validate(dispatch).await;
        self.in_flight.lock().insert(dispatch.step.id.clone(), metrics);
        if !check.blocking.is_empty() {
            info!(
                step_id = %dispatch.step.id,
                violations = check.blocking.len(),
                "Pre-dispatch validation blocked step"
            );
            return Ok(PreDispatch::Block {
                reasons: check.blocking,
            });
        }
        Ok(PreDispatch::Proceed {
            inputs: check.inputs,
            warnings: check.warnings,
        })
    }

    async fn after_dispatch(&self, dispatch: &StepDispatch, outputs: &Value) -> Result<Verdict> {
        let result = self
            .contracts
            .validate_step_output(&dispatch.definition.id, outputs)
            .await;
        self.in_flight
            .lock()
            .entry(dispatch.step.id.clone())
            .or_default()
            .record_contract(format!("step_output:{}", dispatch.definition.name), &result);
        if !result.valid {
            return Ok(Verdict::Reject {
                reasons: result
                    .error_messages()
                    .into_iter()
                    .map(|m| format!("[output_contract] {m}"))
                    .collect(),
            });
        }
        Ok(Verdict::Accept {
            warnings: Vec::new(),
            data: result.validated_data,
        })
    }

    async fn step_finished(&self, dispatch: &StepDispatch, report: &StepReport) -> Result<()> {
        // A waiting step is scored once its outputs arrive.
        if report.status == StepStatus::WaitingInput {
            self.auditor
                .record(
                    &dispatch.run.organization_id,
                    &dispatch.run.id,
                    ComplianceEvent::StepAwaitingInput,
                    json!({
                        "step_id": dispatch.step.id,
                        "step_name": dispatch.definition.name,
                        "attempt": dispatch.step.attempt,
                        "warnings": report.warnings,
                    }),
                )
                .await;
            return Ok(());
        }

        let metrics = self
            .in_flight
            .lock()
            .remove(&dispatch.step.id)
            .unwrap_or_default();
        let step_score = self.record_step(&dispatch.run.id, metrics);
        let run_score = self.compliance_score(&dispatch.run.id).unwrap_or(100);

        self.auditor
            .record(
                &dispatch.run.organization_id,
                &dispatch.run.id,
                ComplianceEvent::StepExecuted,
                json!({
                    "step_id": dispatch.step.id,
                    "step_name": dispatch.definition.name,
                    "status": report.status,
                    "attempt": dispatch.step.attempt,
                    "compliance_score": step_score,
                    "run_compliance_score": run_score,
                    "violations": report.violations,
                    "warnings": report.warnings,
                }),
            )
            .await;
        Ok(())
    }

    async fn before_run_completion(&self, run: &PlaybookRun, outputs: &Value) -> Result<Verdict> {
        let result = self
            .contracts
            .validate_playbook_output(&run.playbook_id, outputs)
            .await;
        let mut metrics = ValidationMetrics::new();
        metrics.record_contract("playbook_output", &result);
        self.record_run_checks(&run.id, metrics);
        self.output_checks
            .lock()
            .insert(run.id.clone(), result.clone());

        if !result.valid {
            return Ok(Verdict::Reject {
                reasons: result.error_messages(),
            });
        }
        Ok(Verdict::Accept {
            warnings: Vec::new(),
            data: result.validated_data,
        })
    }

    async fn run_finished(&self, run: &PlaybookRun) -> Result<()> {
        let event = match run.status {
            RunStatus::Completed => ComplianceEvent::RunCompleted,
            RunStatus::Failed if !run.validation_errors.is_empty() => ComplianceEvent::RunRejected,
            RunStatus::Failed => ComplianceEvent::RunFailed,
            _ => return Ok(()),
        };
        self.auditor
            .record(
                &run.organization_id,
                &run.id,
                event,
                json!({
                    "status": run.status,
                    "compliance_score": self.compliance_score(&run.id).unwrap_or(100),
                    "validation_errors": run.validation_errors,
                    "failure_reason": run.failure_reason,
                }),
            )
            .await;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ContractAwareOrchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// An [`Orchestrator`] with a [`ContractGate`] installed.
#[derive(Clone)]
pub struct ContractAwareOrchestrator {
    orchestrator: Orchestrator,
    gate: Arc<ContractGate>,
}

impl ContractAwareOrchestrator {
    /// Install a default gate sharing the orchestrator's contract service.
    pub fn new(orchestrator: Orchestrator) -> Self {
        let gate = ContractGate::new(orchestrator.contracts().clone(), orchestrator.repo().clone());
        Self::with_gate(orchestrator, Arc::new(gate))
    }

    pub fn with_gate(orchestrator: Orchestrator, gate: Arc<ContractGate>) -> Self {
        orchestrator.add_middleware(gate.clone());
        Self { orchestrator, gate }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn gate(&self) -> &Arc<ContractGate> {
        &self.gate
    }

    /// Validate inputs and the approval policy, then start the run with the
    /// normalized inputs. Nothing is created when validation fails.
    pub async fn start_run(
        &self,
        playbook_id: &str,
        inputs: Value,
        options: RunOptions,
    ) -> Result<PlaybookRun> {
        let contracts = self.orchestrator.contracts();
        let mut metrics = ValidationMetrics::new();

        let input = contracts.validate_playbook_input(playbook_id, &inputs).await;
        metrics.record_contract("playbook_input", &input);
        if !input.valid {
            return Err(EngineError::ContractViolation(format!(
                "Playbook input validation failed: {}",
                input.error_messages().join("; ")
            )));
        }
        let inputs = input.validated_data.unwrap_or(inputs);

        let context = ExecutionContext::from_inputs(&inputs);
        let approval = contracts
            .validate_approval_policy(playbook_id, &approval_context(&context))
            .await;
        if approval.is_critical() {
            return Err(EngineError::PolicyViolation(format!(
                "approval policy blocked run: {}",
                approval.message
            )));
        }
        if !approval.compliant {
            warn!(playbook_id, message = %approval.message, "Approval policy not satisfied");
        }
        metrics.record_policy(approval);

        let run = self
            .orchestrator
            .start_run(playbook_id, inputs, options)
            .await?;
        let score = metrics.compliance_score();
        self.gate.record_run_checks(&run.id, metrics);
        self.gate
            .auditor
            .record(
                &run.organization_id,
                &run.id,
                ComplianceEvent::RunStarted,
                json!({
                    "playbook_id": playbook_id,
                    "correlation_id": run.correlation_id,
                    "compliance_score": score,
                }),
            )
            .await;
        Ok(run)
    }

    /// Dispatch one step of `run_id` now, through the gate.
    pub async fn execute_step(
        &self,
        run_id: &str,
        step_id: &str,
        inputs: Option<Value>,
    ) -> Result<StepExecutionResult> {
        let step = self.orchestrator.repo().get_step_execution(step_id).await?;
        if step.run_id != run_id {
            return Err(EngineError::InvalidRequest(format!(
                "step {step_id} does not belong to run {run_id}"
            )));
        }
        let report = self.orchestrator.process_step(step_id, inputs).await?;
        debug!(
            step_id,
            status = %report.status,
            dispatched = report.dispatched,
            "Step executed"
        );
        Ok(StepExecutionResult {
            step_id: report.step_id,
            status: report.status,
            outputs: report.outputs,
            policy_violations: report.violations,
            validation_warnings: report.warnings,
            compliance_score: self.gate.compliance_score(run_id).unwrap_or(100),
            error: report.error,
        })
    }

    /// Complete a run whose steps have all finished. Outputs failing the
    /// output contract fail the run and report `success: false`.
    pub async fn complete_run(&self, run_id: &str, outputs: Value) -> Result<RunCompletionResult> {
        let success = match self.orchestrator.complete_run(run_id, outputs).await {
            Ok(_) => true,
            Err(EngineError::ContractViolation(message)) => {
                info!(run_id, %message, "Run completion rejected");
                false
            }
            Err(e) => return Err(e),
        };
        let run = self.orchestrator.repo().get_run(run_id).await?;
        Ok(RunCompletionResult {
            success,
            run,
            validation_results: self.gate.output_checks.lock().get(run_id).cloned(),
        })
    }

    pub fn compliance_score(&self, run_id: &str) -> Option<u8> {
        self.gate.compliance_score(run_id)
    }

    pub fn metrics(&self, run_id: &str) -> Option<RunMetrics> {
        self.gate.metrics(run_id)
    }

    pub async fn audit_trail(&self, run_id: &str) -> Result<Vec<TransactionRecord>> {
        self.gate.auditor.events(run_id).await
    }
}
