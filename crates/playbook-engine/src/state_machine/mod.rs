//! Lifecycle authority for playbooks, runs and step executions.
//!
//! Every status change in the engine funnels through [`StateMachine`]. A
//! transition is legal only if a registered [`TransitionRule`] matches the
//! record kind, its current state and the target state, and every guard on
//! that rule allows it.
//!
//! ```text
//! transition(kind, id, to, ctx)
//!   ├─ current_state ─► matching rules ─► guards (in order)
//!   ├─ audit: append state_transition record
//!   ├─ update status + timestamp field
//!   └─ post-actions (best-effort, logged on failure)
//! ```
//!
//! Rules are data: embedders extend the table with [`StateMachine::register_rule`]
//! instead of editing the core loop.

mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use playbook_contracts::ContractValidationService;
use playbook_types::{
    EngineEvent, EntityKind, Id, Metadata, PlaybookStatus, RetryPolicy, RunStatus, StepStatus,
    TransitionRecord,
};

use crate::error::{EngineError, Result};
use crate::repository::{PlaybookRepository, RecordState};
use crate::workers::WorkerRegistry;

pub use rules::default_rules;

// ─────────────────────────────────────────────────────────────────────────────
// Requests and decisions
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-supplied details for one transition.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub actor: String,
    pub reason: Option<String>,
    /// Downgrade overridable guard rejections to warnings.
    pub force: bool,
    /// Guard inputs, e.g. `outputs`, `inputs`, `side_effects`, `retryable`.
    pub data: Value,
    /// Extra metadata written together with the new status.
    pub patch: Metadata,
}

impl Default for TransitionContext {
    fn default() -> Self {
        Self {
            actor: "system".to_string(),
            reason: None,
            force: false,
            data: Value::Null,
            patch: Metadata::new(),
        }
    }
}

impl TransitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.data.is_object() {
            self.data = json!({});
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn with_patch(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.patch.insert(key.to_string(), value.into());
        self
    }

    /// A value from `data`.
    pub fn data_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Everything a guard or post-action may inspect.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub kind: EntityKind,
    pub entity_id: Id,
    pub organization_id: Id,
    pub from: String,
    pub to: String,
    pub context: TransitionContext,
}

/// Result of evaluating a transition without applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionDecision {
    pub allowed: bool,
    pub from: String,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl TransitionDecision {
    fn rejected(from: &str, reason: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            allowed: false,
            from: from.to_string(),
            reason: Some(reason.into()),
            warnings,
        }
    }
}

/// What a guard concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Allow,
    /// Blocks the transition. Non-empty `warnings` mark the rejection as
    /// overridable by a forced transition.
    Reject {
        reason: String,
        warnings: Vec<String>,
    },
}

impl GuardVerdict {
    pub fn reject(reason: impl Into<String>) -> Self {
        GuardVerdict::Reject {
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }

    pub fn overridable(reason: impl Into<String>, warning: impl Into<String>) -> Self {
        GuardVerdict::Reject {
            reason: reason.into(),
            warnings: vec![warning.into()],
        }
    }
}

#[async_trait]
pub trait TransitionGuard: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, machine: &StateMachine, request: &TransitionRequest)
    -> Result<GuardVerdict>;
}

#[async_trait]
pub trait PostAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, machine: &StateMachine, request: &TransitionRequest) -> Result<()>;
}

/// One row of the transition table.
#[derive(Clone)]
pub struct TransitionRule {
    pub kind: EntityKind,
    pub from: Vec<String>,
    pub to: String,
    pub guards: Vec<Arc<dyn TransitionGuard>>,
    pub post_actions: Vec<Arc<dyn PostAction>>,
}

impl TransitionRule {
    pub fn new(kind: EntityKind, from: &[&str], to: &str) -> Self {
        Self {
            kind,
            from: from.iter().map(|s| s.to_string()).collect(),
            to: to.to_string(),
            guards: Vec::new(),
            post_actions: Vec::new(),
        }
    }

    pub fn guard(mut self, guard: impl TransitionGuard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn then(mut self, action: impl PostAction + 'static) -> Self {
        self.post_actions.push(Arc::new(action));
        self
    }

    fn matches(&self, kind: EntityKind, from: &str, to: &str) -> bool {
        self.kind == kind && self.to == to && self.from.iter().any(|f| f == from)
    }
}

impl std::fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionRule")
            .field("kind", &self.kind)
            .field("from", &self.from)
            .field("to", &self.to)
            .field(
                "guards",
                &self.guards.iter().map(|g| g.name().to_string()).collect::<Vec<_>>(),
            )
            .field(
                "post_actions",
                &self
                    .post_actions
                    .iter()
                    .map(|a| a.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Knobs consulted by the default guards and post-actions.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Runs allowed in progress or blocked per organization.
    pub max_active_runs: Option<usize>,
    /// Delay from blocking a run to its escalation deadline.
    pub escalation_after: ChronoDuration,
    /// Used for steps without a retry policy of their own.
    pub default_retry: RetryPolicy,
    pub fallback_backoff_secs: u64,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            max_active_runs: None,
            escalation_after: ChronoDuration::hours(24),
            default_retry: RetryPolicy::default(),
            fallback_backoff_secs: 60,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StateMachine
// ─────────────────────────────────────────────────────────────────────────────

pub struct StateMachine {
    repo: PlaybookRepository,
    contracts: Arc<ContractValidationService>,
    workers: Option<Arc<WorkerRegistry>>,
    events: Option<broadcast::Sender<EngineEvent>>,
    settings: MachineSettings,
    rules: RwLock<Vec<TransitionRule>>,
}

impl StateMachine {
    /// Create a machine loaded with the default transition table.
    pub fn new(repo: PlaybookRepository, contracts: Arc<ContractValidationService>) -> Self {
        Self {
            repo,
            contracts,
            workers: None,
            events: None,
            settings: MachineSettings::default(),
            rules: RwLock::new(default_rules()),
        }
    }

    pub fn with_workers(mut self, workers: Arc<WorkerRegistry>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_settings(mut self, settings: MachineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn repo(&self) -> &PlaybookRepository {
        &self.repo
    }

    pub fn contracts(&self) -> &Arc<ContractValidationService> {
        &self.contracts
    }

    pub fn workers(&self) -> Option<&Arc<WorkerRegistry>> {
        self.workers.as_ref()
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    /// Add a rule. Rules for the same `(kind, from, to)` stack: all their
    /// guards and post-actions apply, in registration order.
    pub fn register_rule(&self, rule: TransitionRule) {
        debug!(kind = %rule.kind, to = %rule.to, "Registered transition rule");
        self.rules.write().push(rule);
    }

    /// Broadcast an event; dropped silently when nobody listens.
    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref events) = self.events {
            let _ = events.send(event);
        }
    }

    pub async fn current_state(&self, kind: EntityKind, id: &str) -> Result<String> {
        Ok(self.repo.state_of(kind, id).await?.status)
    }

    /// Evaluate the guards for a transition without applying it.
    pub async fn can_transition(
        &self,
        kind: EntityKind,
        id: &str,
        to: &str,
        context: &TransitionContext,
    ) -> Result<TransitionDecision> {
        let state = self.repo.state_of(kind, id).await?;
        let (decision, _) = self.evaluate(kind, id, &state, to, context).await;
        Ok(decision)
    }

    /// Validate, audit, apply and run post-actions.
    pub async fn transition(
        &self,
        kind: EntityKind,
        id: &str,
        to: &str,
        context: TransitionContext,
    ) -> Result<TransitionRecord> {
        let state = self.repo.state_of(kind, id).await?;
        let (decision, post_actions) = self.evaluate(kind, id, &state, to, &context).await;
        if !decision.allowed {
            return Err(not_allowed(kind, id, &decision, to));
        }

        let request = TransitionRequest {
            kind,
            entity_id: id.to_string(),
            organization_id: state.organization_id.clone(),
            from: decision.from.clone(),
            to: to.to_string(),
            context,
        };
        let record = self.audit(&request, &decision.warnings).await?;
        self.repo
            .patch_record(kind, id, status_patch(&request))
            .await?;
        info!(
            kind = %kind,
            entity_id = id,
            from = %request.from,
            to,
            actor = %request.context.actor,
            "State transition"
        );
        self.run_post_actions(&post_actions, &request).await;
        Ok(record)
    }

    /// Conditional `from → to` for a step execution.
    ///
    /// The status write only lands if the step is still in `from` when the
    /// store applies it. Returns `None` when another poller got there first;
    /// the audit record is written only for a won claim.
    pub async fn claim(
        &self,
        id: &str,
        from: StepStatus,
        to: StepStatus,
        context: TransitionContext,
    ) -> Result<Option<TransitionRecord>> {
        let kind = EntityKind::Step;
        let state = self.repo.state_of(kind, id).await?;
        if state.status != from.as_str() {
            return Ok(None);
        }
        let (decision, post_actions) = self
            .evaluate(kind, id, &state, to.as_str(), &context)
            .await;
        if !decision.allowed {
            return Err(not_allowed(kind, id, &decision, to.as_str()));
        }

        let request = TransitionRequest {
            kind,
            entity_id: id.to_string(),
            organization_id: state.organization_id.clone(),
            from: decision.from.clone(),
            to: to.as_str().to_string(),
            context,
        };
        if !self
            .repo
            .claim_step(id, from, status_patch(&request))
            .await?
        {
            debug!(step_id = id, "Lost step claim");
            return Ok(None);
        }
        let record = self.audit(&request, &decision.warnings).await?;
        self.run_post_actions(&post_actions, &request).await;
        Ok(Some(record))
    }

    /// Audit trail for one record, oldest first.
    pub async fn history(&self, kind: EntityKind, id: &str) -> Result<Vec<TransitionRecord>> {
        self.repo.transitions(kind, id).await
    }

    async fn evaluate(
        &self,
        kind: EntityKind,
        id: &str,
        state: &RecordState,
        to: &str,
        context: &TransitionContext,
    ) -> (TransitionDecision, Vec<Arc<dyn PostAction>>) {
        let from = state.status.as_str();
        // Clone out of the lock so no guard runs while it is held.
        let (guards, post_actions) = {
            let rules = self.rules.read();
            let matching: Vec<&TransitionRule> =
                rules.iter().filter(|r| r.matches(kind, from, to)).collect();
            if matching.is_empty() {
                return (
                    TransitionDecision::rejected(from, "invalid transition", Vec::new()),
                    Vec::new(),
                );
            }
            let guards: Vec<Arc<dyn TransitionGuard>> = matching
                .iter()
                .flat_map(|r| r.guards.iter().cloned())
                .collect();
            let post_actions: Vec<Arc<dyn PostAction>> = matching
                .iter()
                .flat_map(|r| r.post_actions.iter().cloned())
                .collect();
            (guards, post_actions)
        };

        let request = TransitionRequest {
            kind,
            entity_id: id.to_string(),
            organization_id: state.organization_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            context: context.clone(),
        };
        let mut warnings = Vec::new();
        let mut first_rejection: Option<String> = None;
        for guard in &guards {
            let verdict = match guard.check(self, &request).await {
                Ok(verdict) => verdict,
                Err(e) => GuardVerdict::reject(format!("{} failed: {e}", guard.name())),
            };
            match verdict {
                GuardVerdict::Allow => {}
                GuardVerdict::Reject {
                    reason,
                    warnings: guard_warnings,
                } => {
                    if context.force && !guard_warnings.is_empty() {
                        warnings.extend(guard_warnings);
                        continue;
                    }
                    if !context.force {
                        return (
                            TransitionDecision::rejected(from, reason, guard_warnings),
                            Vec::new(),
                        );
                    }
                    // Forced: keep evaluating so every warning is collected.
                    first_rejection.get_or_insert(reason);
                }
            }
        }

        if let Some(reason) = first_rejection {
            return (
                TransitionDecision::rejected(from, reason, warnings),
                Vec::new(),
            );
        }
        (
            TransitionDecision {
                allowed: true,
                from: from.to_string(),
                reason: context.reason.clone(),
                warnings,
            },
            post_actions,
        )
    }

    async fn audit(&self, request: &TransitionRequest, warnings: &[String]) -> Result<TransitionRecord> {
        let record = TransitionRecord {
            id: Id::new(),
            entity_kind: request.kind,
            entity_id: request.entity_id.clone(),
            from_state: request.from.clone(),
            to_state: request.to.clone(),
            smart_code: String::new(),
            actor: request.context.actor.clone(),
            reason: request.context.reason.clone(),
            warnings: warnings.to_vec(),
            data: request.context.data.clone(),
            occurred_at: playbook_types::now(),
        };
        self.repo
            .append_transition(&request.organization_id, &record)
            .await
    }

    async fn run_post_actions(&self, actions: &[Arc<dyn PostAction>], request: &TransitionRequest) {
        for action in actions {
            if let Err(e) = action.run(self, request).await {
                warn!(
                    action = action.name(),
                    kind = %request.kind,
                    entity_id = %request.entity_id,
                    error = %e,
                    "Post-action failed"
                );
            }
        }
    }
}

fn not_allowed(kind: EntityKind, id: &str, decision: &TransitionDecision, to: &str) -> EngineError {
    EngineError::TransitionNotAllowed {
        kind,
        entity_id: id.to_string(),
        from: decision.from.clone(),
        to: to.to_string(),
        reason: decision
            .reason
            .clone()
            .unwrap_or_else(|| "rejected".to_string()),
    }
}

/// New status, the matching timestamp field and the caller's extra fields.
fn status_patch(request: &TransitionRequest) -> Metadata {
    let mut patch = request.context.patch.clone();
    patch.insert("status".into(), Value::String(request.to.clone()));
    let now = json!(playbook_types::now());

    let fields: &[&str] = match (request.kind, request.to.as_str()) {
        (EntityKind::Playbook, "published") => &["published_at"],
        (EntityKind::Playbook, "archived") => &["archived_at"],
        (EntityKind::Run, "in_progress") if request.from == RunStatus::Queued.as_str() => {
            &["started_at"]
        }
        (EntityKind::Run, "blocked") => &["blocked_at"],
        (EntityKind::Run, "completed") => &["completed_at"],
        (EntityKind::Run, "failed") => &["failed_at", "completed_at"],
        (EntityKind::Run, "cancelled") => &["cancelled_at", "completed_at"],
        (EntityKind::Step, "running") if request.from == StepStatus::Pending.as_str() => {
            &["started_at"]
        }
        (EntityKind::Step, "completed") => &["completed_at"],
        (EntityKind::Step, "failed") => &["failed_at"],
        (EntityKind::Step, "skipped") => &["completed_at"],
        _ => &[],
    };
    for field in fields {
        patch.entry(field.to_string()).or_insert_with(|| now.clone());
    }
    patch
}

/// Published playbooks accept runs.
pub(crate) fn is_published(status: &str) -> bool {
    status == PlaybookStatus::Published.as_str()
}
