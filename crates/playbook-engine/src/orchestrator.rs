//! The polling orchestrator.
//!
//! ```text
//!            ┌──────────── start() ────────────┐
//!            ▼                                 │
//!   interval tick ─┐                           │
//!   signal recv  ──┼─► poll_once()             │
//!   cancel  ───────┘     ├─ reap stale running steps
//!                        ├─ find_executable_steps (capacity-capped)
//!                        └─ spawn process_step per step
//!                               ├─ middleware.before_dispatch
//!                               ├─ claim pending → running
//!                               ├─ WorkerRegistry[worker_type].execute
//!                               ├─ middleware.after_dispatch
//!                               ├─ running → completed | waiting_input | failed
//!                               └─ advance_run (unlock, progress, finish)
//! ```
//!
//! All state lives in the store; the orchestrator itself only tracks which
//! steps it has in flight. Every status change goes through the
//! [`StateMachine`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use playbook_ai::{InsightService, SharedAiBackend};
use playbook_contracts::ContractValidationService;
use playbook_store::SharedStore;
use playbook_types::{
    EngineEvent, EntityKind, Id, PlaybookRun, Priority, RunProgress, RunStatus, Signal,
    SignalType, StepError, StepExecution, StepStatus, WorkerType,
};

use crate::dispatch::{ExecutionContext, StepDispatch};
use crate::error::{EngineError, Result};
use crate::inputs;
use crate::middleware::{PreDispatch, ValidationMiddleware, Verdict};
use crate::repository::PlaybookRepository;
use crate::scheduler;
use crate::state_machine::{MachineSettings, StateMachine, TransitionContext};
use crate::workers::{
    AiStepDefaults, AiStepWorker, HttpServiceWorker, HttpWorkerConfig, HumanTaskWorker,
    StepWorker, WorkerOutcome, WorkerOutput, WorkerRegistry,
};

const EVENT_CAPACITY: usize = 256;
const SIGNAL_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub organization_id: String,
    pub poll_interval: Duration,
    pub max_concurrent_steps: usize,
    /// Route running steps that outlived their SLA back into the retry path.
    pub reaper_enabled: bool,
    pub stale_step_grace: Duration,
    /// Complete a run automatically once every step has finished.
    pub auto_complete_runs: bool,
    /// Recorded as `claimed_by` on claimed steps.
    pub instance_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            organization_id: "default".to_string(),
            poll_interval: Duration::from_millis(1000),
            max_concurrent_steps: 10,
            reaper_enabled: true,
            stale_step_grace: Duration::from_secs(60),
            auto_complete_runs: true,
            instance_id: format!("orchestrator-{}", playbook_types::new_id()),
        }
    }
}

/// Options for [`Orchestrator::start_run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub priority: Priority,
    /// Generated when absent.
    pub correlation_id: Option<String>,
    pub actor: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            correlation_id: None,
            actor: "system".to_string(),
        }
    }
}

/// Details for an explicit step completion (human steps).
#[derive(Debug, Clone)]
pub struct CompletionMeta {
    pub actor: String,
    pub confidence: Option<f64>,
    pub insights: Option<String>,
    pub side_effects: Vec<String>,
}

impl CompletionMeta {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            confidence: None,
            insights: None,
            side_effects: Vec::new(),
        }
    }
}

/// What happened to one step during a dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_id: Id,
    pub run_id: Id,
    /// Status after the attempt; `pending` again when a retry was scheduled.
    pub status: StepStatus,
    /// False when the step was not in a dispatchable state.
    pub dispatched: bool,
    pub outputs: Option<Value>,
    /// Reasons a policy or contract gate stopped the step.
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<StepError>,
}

impl StepReport {
    fn idle(step: &StepExecution) -> Self {
        Self {
            step_id: step.id.clone(),
            run_id: step.run_id.clone(),
            status: step.status,
            dispatched: false,
            outputs: step.outputs.clone(),
            violations: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    fn dispatched(step: &StepExecution, warnings: Vec<String>) -> Self {
        Self {
            dispatched: true,
            warnings,
            ..Self::idle(step)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`Orchestrator`].
///
/// Human steps always get a [`HumanTaskWorker`]; AI and HTTP workers are
/// added when a backend or HTTP settings are supplied, unless a worker for
/// that type was registered explicitly.
pub struct OrchestratorBuilder {
    store: Option<SharedStore>,
    config: OrchestratorConfig,
    settings: MachineSettings,
    contracts: Option<Arc<ContractValidationService>>,
    workers: WorkerRegistry,
    ai_backend: Option<SharedAiBackend>,
    ai_defaults: AiStepDefaults,
    http: Option<HttpWorkerConfig>,
    insights: InsightService,
    middleware: Vec<Arc<dyn ValidationMiddleware>>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            config: OrchestratorConfig::default(),
            settings: MachineSettings::default(),
            contracts: None,
            workers: WorkerRegistry::new(),
            ai_backend: None,
            ai_defaults: AiStepDefaults::default(),
            http: None,
            insights: InsightService::default(),
            middleware: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_settings(mut self, settings: MachineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share a contract service (and its schema cache) with other components.
    pub fn with_contracts(mut self, contracts: Arc<ContractValidationService>) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn with_worker(mut self, worker_type: WorkerType, worker: Arc<dyn StepWorker>) -> Self {
        self.workers.register(worker_type, worker);
        self
    }

    pub fn with_ai_backend(mut self, backend: SharedAiBackend) -> Self {
        self.ai_backend = Some(backend);
        self
    }

    pub fn with_ai_defaults(mut self, defaults: AiStepDefaults) -> Self {
        self.ai_defaults = defaults;
        self
    }

    /// Serve system and external steps over HTTP.
    pub fn with_http_workers(mut self, config: HttpWorkerConfig) -> Self {
        self.http = Some(config);
        self
    }

    pub fn with_insights(mut self, insights: InsightService) -> Self {
        self.insights = insights;
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn ValidationMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let store = self
            .store
            .ok_or_else(|| EngineError::Setup("orchestrator requires a store".to_string()))?;
        if self.config.max_concurrent_steps == 0 {
            return Err(EngineError::Setup(
                "max_concurrent_steps must be at least 1".to_string(),
            ));
        }
        let repo = PlaybookRepository::new(store.clone());
        let contracts = self
            .contracts
            .unwrap_or_else(|| Arc::new(ContractValidationService::new(store)));

        let mut workers = self.workers;
        if !workers.contains(WorkerType::Human) {
            workers.register(WorkerType::Human, Arc::new(HumanTaskWorker::new(repo.clone())));
        }
        if let Some(backend) = self.ai_backend
            && !workers.contains(WorkerType::Ai)
        {
            let worker = AiStepWorker::new(backend, self.ai_defaults, self.insights.clone())
                .with_repository(repo.clone());
            workers.register(WorkerType::Ai, Arc::new(worker));
        }
        if let Some(http) = self.http {
            let worker: Arc<dyn StepWorker> = Arc::new(HttpServiceWorker::new(http)?);
            for worker_type in [WorkerType::System, WorkerType::External] {
                if !workers.contains(worker_type) {
                    workers.register(worker_type, worker.clone());
                }
            }
        }
        let workers = Arc::new(workers);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let machine = StateMachine::new(repo, contracts)
            .with_workers(workers.clone())
            .with_events(events.clone())
            .with_settings(self.settings);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);

        debug!(
            organization_id = %self.config.organization_id,
            workers = ?workers.registered(),
            middleware = self.middleware.len(),
            "Orchestrator built"
        );
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                machine,
                workers,
                insights: self.insights,
                events,
                middleware: RwLock::new(self.middleware),
                active: Mutex::new(HashMap::new()),
                settle: tokio::sync::Mutex::new(()),
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
                lifecycle: Mutex::new(Lifecycle {
                    shutdown: CancellationToken::new(),
                    handle: None,
                }),
            }),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

struct Lifecycle {
    /// Parent of every in-flight step token.
    shutdown: CancellationToken,
    handle: Option<JoinHandle<mpsc::Receiver<Signal>>>,
}

struct Inner {
    config: OrchestratorConfig,
    machine: StateMachine,
    workers: Arc<WorkerRegistry>,
    insights: InsightService,
    events: broadcast::Sender<EngineEvent>,
    middleware: RwLock<Vec<Arc<dyn ValidationMiddleware>>>,
    active: Mutex<HashMap<Id, CancellationToken>>,
    /// Serializes terminal step changes with run advancement so no reader
    /// sees a failed step before its retry is scheduled.
    settle: tokio::sync::Mutex<()>,
    signal_tx: mpsc::Sender<Signal>,
    /// Held here while the loop is stopped.
    signal_rx: Mutex<Option<mpsc::Receiver<Signal>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Removes a step from the in-flight map when its processing ends.
struct ActiveSlot {
    inner: Arc<Inner>,
    step_id: Id,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.step_id);
    }
}

/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn machine(&self) -> &StateMachine {
        &self.inner.machine
    }

    pub fn repo(&self) -> &PlaybookRepository {
        self.inner.machine.repo()
    }

    pub fn contracts(&self) -> &Arc<ContractValidationService> {
        self.inner.machine.contracts()
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.inner.workers
    }

    pub fn insights(&self) -> &InsightService {
        &self.inner.insights
    }

    pub fn add_middleware(&self, middleware: Arc<dyn ValidationMiddleware>) {
        self.inner.middleware.write().push(middleware);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn signal_sender(&self) -> mpsc::Sender<Signal> {
        self.inner.signal_tx.clone()
    }

    /// Steps currently being processed by this instance.
    pub fn active_steps(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn the polling loop. The first poll happens immediately. Calling
    /// `start` on a running orchestrator does nothing.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Some(signals) = self.inner.signal_rx.lock().take() else {
            warn!("Signal receiver unavailable, poll loop not started");
            return;
        };
        if lifecycle.shutdown.is_cancelled() {
            lifecycle.shutdown = CancellationToken::new();
        }
        let shutdown = lifecycle.shutdown.clone();
        let this = self.clone();
        lifecycle.handle = Some(tokio::spawn(async move {
            this.run_loop(shutdown, signals).await
        }));
        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            max_concurrent_steps = self.inner.config.max_concurrent_steps,
            "Orchestrator started"
        );
    }

    /// Cancel the loop and every in-flight step, then wait for the loop to
    /// exit. Calling `stop` on a stopped orchestrator does nothing.
    pub async fn stop(&self) {
        let handle = {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.shutdown.cancel();
            lifecycle.handle.take()
        };
        let Some(handle) = handle else {
            return;
        };
        match handle.await {
            Ok(signals) => {
                *self.inner.signal_rx.lock() = Some(signals);
            }
            Err(e) => warn!(error = %e, "Poll loop ended abnormally"),
        }
        info!("Orchestrator stopped");
    }

    async fn run_loop(
        self,
        shutdown: CancellationToken,
        mut signals: mpsc::Receiver<Signal>,
    ) -> mpsc::Receiver<Signal> {
        let mut ticker = tokio::time::interval(self.inner.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.poll_logged().await,
                Some(signal) = signals.recv() => {
                    if let Err(e) = self.handle_signal(signal).await {
                        warn!(error = %e, "Signal handling failed");
                    }
                }
            }
        }
        debug!("Poll loop exited");
        signals
    }

    async fn poll_logged(&self) {
        match self.poll_once().await {
            Ok(handles) if !handles.is_empty() => {
                debug!(dispatched = handles.len(), "Poll dispatched steps");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Poll failed"),
        }
    }

    fn nudge(&self) {
        // A full channel already guarantees a poll.
        let _ = self.inner.signal_tx.try_send(Signal::step_ready());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Polling
    // ─────────────────────────────────────────────────────────────────────

    /// One scheduling pass: reap stale steps, then spawn a task per
    /// executable step up to free capacity. Returns the spawned tasks.
    pub async fn poll_once(&self) -> Result<Vec<JoinHandle<()>>> {
        if self.inner.config.reaper_enabled {
            self.reap_stale_steps().await?;
        }
        let steps = self.find_executable_steps().await?;
        let mut handles = Vec::with_capacity(steps.len());
        for step in steps {
            let Some((slot, token)) = self.occupy(&step.id) else {
                continue;
            };
            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let _slot = slot;
                if let Err(e) = this.run_step(&step.id, None, &token).await {
                    warn!(step_id = %step.id, error = %e, "Step processing failed");
                }
            }));
        }
        Ok(handles)
    }

    /// Poll and wait until a pass dispatches nothing. Returns how many step
    /// tasks ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let handles = self.poll_once().await?;
            if handles.is_empty() {
                return Ok(total);
            }
            total += handles.len();
            futures::future::join_all(handles).await;
        }
    }

    /// Drive a run until it is terminal or `timeout` passes; returns its
    /// latest state either way.
    pub async fn run_until_settled(&self, run_id: &str, timeout: Duration) -> Result<PlaybookRun> {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain().await?;
            let run = self.repo().get_run(run_id).await?;
            if run.status.is_terminal() || Instant::now() >= deadline {
                return Ok(run);
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// Pending steps of in-progress runs that may start now, best first,
    /// capped at free capacity.
    pub async fn find_executable_steps(&self) -> Result<Vec<StepExecution>> {
        let free = self.free_capacity();
        if free == 0 {
            return Ok(Vec::new());
        }
        let repo = self.repo();
        let pending = repo
            .steps_with_status(&self.inner.config.organization_id, StepStatus::Pending)
            .await?;

        let mut run_ids: Vec<Id> = pending.iter().map(|s| s.run_id.clone()).collect();
        run_ids.sort();
        run_ids.dedup();

        let now = playbook_types::now();
        let mut candidates = Vec::new();
        for run_id in run_ids {
            let run = repo.get_run(&run_id).await?;
            if run.status != RunStatus::InProgress {
                continue;
            }
            let run_steps = repo.run_steps(&run_id).await?;
            let active = self.inner.active.lock();
            candidates.extend(
                run_steps
                    .iter()
                    .filter(|s| !active.contains_key(&s.id))
                    .filter(|s| scheduler::is_executable(s, &run_steps, now))
                    .cloned(),
            );
        }
        Ok(scheduler::select(candidates, free))
    }

    fn free_capacity(&self) -> usize {
        self.inner
            .config
            .max_concurrent_steps
            .saturating_sub(self.inner.active.lock().len())
    }

    fn occupy(&self, step_id: &str) -> Option<(ActiveSlot, CancellationToken)> {
        let token = self.inner.lifecycle.lock().shutdown.child_token();
        let mut active = self.inner.active.lock();
        if active.contains_key(step_id) {
            return None;
        }
        active.insert(step_id.to_string(), token.clone());
        Some((
            ActiveSlot {
                inner: self.inner.clone(),
                step_id: step_id.to_string(),
            },
            token,
        ))
    }

    /// Running steps that outlived SLA plus grace and are not in flight here.
    async fn reap_stale_steps(&self) -> Result<()> {
        let running = self
            .repo()
            .steps_with_status(&self.inner.config.organization_id, StepStatus::Running)
            .await?;
        let now = playbook_types::now();
        let grace = chrono::Duration::from_std(self.inner.config.stale_step_grace)
            .unwrap_or(chrono::Duration::zero());
        for step in running {
            if self.inner.active.lock().contains_key(&step.id) {
                continue;
            }
            let Some(started_at) = step.started_at else {
                continue;
            };
            let Some(deadline) = playbook_types::after_secs(started_at, step.sla_seconds)
                .and_then(|d| d.checked_add_signed(grace))
            else {
                continue;
            };
            if deadline >= now {
                continue;
            }
            warn!(step_id = %step.id, run_id = %step.run_id, "Reaping stale step");
            self.fail_step(&step.id, "STALE_STEP", "no result within SLA", true)
                .await?;
            self.advance_logged(&step.run_id).await;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Step processing
    // ─────────────────────────────────────────────────────────────────────

    /// Dispatch one pending step now, bypassing the scheduler's ordering.
    /// `extra_inputs` are merged over the resolved inputs.
    pub async fn process_step(&self, step_id: &str, extra_inputs: Option<Value>) -> Result<StepReport> {
        let Some((_slot, token)) = self.occupy(step_id) else {
            let step = self.repo().get_step_execution(step_id).await?;
            return Ok(StepReport::idle(&step));
        };
        self.run_step(step_id, extra_inputs, &token).await
    }

    async fn run_step(
        &self,
        step_id: &str,
        extra_inputs: Option<Value>,
        token: &CancellationToken,
    ) -> Result<StepReport> {
        let step = self.repo().get_step_execution(step_id).await?;
        let run = self.repo().get_run(&step.run_id).await?;
        if step.status != StepStatus::Pending || run.status != RunStatus::InProgress {
            return Ok(StepReport::idle(&step));
        }
        let mut dispatch = self.prepare(run, step, extra_inputs.as_ref()).await?;
        let report = self.drive(&mut dispatch, token).await?;
        if report.dispatched && report.status != StepStatus::Running {
            self.step_finished(&dispatch, &report).await;
        }
        Ok(report)
    }

    async fn prepare(
        &self,
        run: PlaybookRun,
        step: StepExecution,
        extra_inputs: Option<&Value>,
    ) -> Result<StepDispatch> {
        let repo = self.repo();
        let definition = repo.get_step_definition(&step.step_id).await?;
        let run_steps = repo.run_steps(&run.id).await?;
        let inputs = inputs::resolve(&run, &run_steps, &definition, extra_inputs);
        Ok(StepDispatch {
            context: ExecutionContext::from_inputs(&inputs),
            completed: run_steps
                .into_iter()
                .filter(|s| s.status == StepStatus::Completed)
                .collect(),
            run,
            step,
            definition,
            inputs,
        })
    }

    async fn drive(&self, dispatch: &mut StepDispatch, token: &CancellationToken) -> Result<StepReport> {
        let step_id = dispatch.step.id.clone();

        let warnings = match self.gate_before(dispatch).await {
            PreDispatch::Proceed { inputs, warnings } => {
                if let Some(inputs) = inputs {
                    dispatch.context = ExecutionContext::from_inputs(&inputs);
                    dispatch.inputs = inputs;
                }
                warnings
            }
            PreDispatch::Block { reasons } => {
                info!(step_id = %step_id, reasons = ?reasons, "Step blocked before dispatch");
                let mut report = self
                    .failed(dispatch, "POLICY_VIOLATION", &reasons.join("; "), false, Vec::new())
                    .await?;
                report.violations = reasons;
                return Ok(report);
            }
        };

        let Some(due_at) = playbook_types::after_secs(playbook_types::now(), dispatch.step.sla_seconds)
        else {
            let message = format!("sla_seconds {} is out of range", dispatch.step.sla_seconds);
            return self
                .failed(dispatch, "INVALID_DEFINITION", &message, false, warnings)
                .await;
        };
        let claim = TransitionContext::new()
            .by(self.inner.config.instance_id.clone())
            .with_data("inputs", dispatch.inputs.clone())
            .with_patch("inputs", dispatch.inputs.clone())
            .with_patch("claimed_by", self.inner.config.instance_id.clone())
            .with_patch("due_at", json!(due_at))
            .with_patch("retry_scheduled_at", Value::Null)
            .with_patch("error", Value::Null);
        match self
            .inner
            .machine
            .claim(&step_id, StepStatus::Pending, StepStatus::Running, claim)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(StepReport::idle(&dispatch.step)),
            Err(EngineError::TransitionNotAllowed { reason, .. }) => {
                return self
                    .failed(dispatch, "TRANSITION_REJECTED", &reason, false, warnings)
                    .await;
            }
            Err(e) => return Err(e),
        }
        dispatch.step.status = StepStatus::Running;
        dispatch.step.inputs = dispatch.inputs.clone();
        dispatch.step.due_at = Some(due_at);

        let Some(worker) = self.inner.workers.get(dispatch.step.worker_type) else {
            let message = format!("no {} worker registered", dispatch.step.worker_type);
            return self.failed(dispatch, "NO_WORKER", &message, false, warnings).await;
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => {
                info!(step_id = %step_id, "Step cancelled in flight, left running");
                let mut report = StepReport::dispatched(&dispatch.step, warnings);
                report.status = StepStatus::Running;
                return Ok(report);
            }
            outcome = worker.execute(dispatch) => outcome,
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(WorkerOutcome::Completed(output)) => {
                let worker_id = dispatch.step.worker_type.as_str().to_string();
                self.finish(dispatch, output, &worker_id, Some(latency_ms), warnings)
                    .await
            }
            Ok(WorkerOutcome::Waiting {
                assignee,
                due_at,
                task_id,
            }) => {
                self.inner
                    .machine
                    .transition(
                        EntityKind::Step,
                        &step_id,
                        StepStatus::WaitingInput.as_str(),
                        TransitionContext::new()
                            .by(self.inner.config.instance_id.clone())
                            .because("awaiting human input")
                            .with_patch("assignee", json!(assignee))
                            .with_patch("due_at", json!(due_at))
                            .with_patch("task_id", task_id),
                    )
                    .await?;
                let mut report = StepReport::dispatched(&dispatch.step, warnings);
                report.status = StepStatus::WaitingInput;
                Ok(report)
            }
            Err(e) => {
                warn!(step_id = %step_id, code = %e.code(), error = %e, "Worker failed");
                let message = match &e {
                    EngineError::Worker { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.failed(dispatch, &e.code(), &message, true, warnings).await
            }
        }
    }

    /// Gate outputs, then move running → completed.
    async fn finish(
        &self,
        dispatch: &StepDispatch,
        output: WorkerOutput,
        worker_id: &str,
        latency_ms: Option<u64>,
        mut warnings: Vec<String>,
    ) -> Result<StepReport> {
        let step_id = dispatch.step.id.clone();
        let mut outputs = output.outputs;
        match self.gate_after(dispatch, &outputs).await {
            Verdict::Accept {
                warnings: extra,
                data,
            } => {
                warnings.extend(extra);
                if let Some(data) = data {
                    outputs = data;
                }
            }
            Verdict::Reject { reasons } => {
                let mut report = self
                    .failed(
                        dispatch,
                        "OUTPUT_CONTRACT_VIOLATION",
                        &reasons.join("; "),
                        false,
                        warnings,
                    )
                    .await?;
                report.violations = reasons;
                return Ok(report);
            }
        }

        let mut context = TransitionContext::new()
            .by(worker_id)
            .with_data("outputs", outputs.clone())
            .with_data("side_effects", json!(output.side_effects))
            .with_patch("outputs", outputs.clone())
            .with_patch("worker_id", worker_id)
            .with_patch("ai_confidence", json!(output.confidence))
            .with_patch("ai_insights", json!(output.insights));
        if let Some(latency_ms) = latency_ms {
            context = context.with_patch("latency_ms", latency_ms);
        }

        let result = {
            let _settle = self.inner.settle.lock().await;
            self.inner
                .machine
                .transition(EntityKind::Step, &step_id, StepStatus::Completed.as_str(), context)
                .await
        };
        match result {
            Ok(_) => {}
            Err(EngineError::TransitionNotAllowed { reason, .. }) => {
                let mut report = self
                    .failed(dispatch, "OUTPUT_REJECTED", &reason, false, warnings)
                    .await?;
                report.violations = vec![reason];
                return Ok(report);
            }
            Err(e) => return Err(e),
        }

        if output.cost > 0.0 {
            let run = self.repo().get_run(&dispatch.run.id).await?;
            self.repo()
                .update_run(&run.id, object(json!({ "cost": run.cost + output.cost })))
                .await?;
        }
        info!(step_id = %step_id, run_id = %dispatch.run.id, ?latency_ms, "Step completed");
        let mut report = StepReport::dispatched(&dispatch.step, warnings);
        report.status = StepStatus::Completed;
        report.outputs = Some(outputs);
        Ok(report)
    }

    async fn failed(
        &self,
        dispatch: &StepDispatch,
        code: &str,
        message: &str,
        retryable: bool,
        warnings: Vec<String>,
    ) -> Result<StepReport> {
        let status = self
            .fail_step(&dispatch.step.id, code, message, retryable)
            .await?;
        let mut report = StepReport::dispatched(&dispatch.step, warnings);
        report.status = status;
        report.error = Some(StepError::new(code, message));
        Ok(report)
    }

    /// Record a failure and let the retry policy decide what happens next.
    /// Returns the step's resulting status.
    pub async fn fail_step(
        &self,
        step_id: &str,
        code: &str,
        message: &str,
        retryable: bool,
    ) -> Result<StepStatus> {
        let _settle = self.inner.settle.lock().await;
        let step = self.repo().get_step_execution(step_id).await?;
        let error = StepError::new(code, message);
        self.inner
            .machine
            .transition(
                EntityKind::Step,
                step_id,
                StepStatus::Failed.as_str(),
                TransitionContext::new()
                    .by(self.inner.config.instance_id.clone())
                    .because(format!("[{code}] {message}"))
                    .with_data("retryable", retryable)
                    .with_patch("attempt", step.attempt + 1)
                    .with_patch("error", serde_json::to_value(&error)?),
            )
            .await?;
        let status = self
            .inner
            .machine
            .current_state(EntityKind::Step, step_id)
            .await?
            .parse::<StepStatus>()?;
        Ok(status)
    }

    /// Finish a step that is waiting for (or running) out-of-band work.
    pub async fn complete_step(
        &self,
        step_id: &str,
        outputs: Value,
        meta: CompletionMeta,
    ) -> Result<StepReport> {
        let step = self.repo().get_step_execution(step_id).await?;
        if step.status == StepStatus::WaitingInput {
            self.inner
                .machine
                .transition(
                    EntityKind::Step,
                    step_id,
                    StepStatus::Running.as_str(),
                    TransitionContext::new()
                        .by(meta.actor.clone())
                        .because("input received"),
                )
                .await?;
        } else if step.status != StepStatus::Running {
            return Err(EngineError::TransitionNotAllowed {
                kind: EntityKind::Step,
                entity_id: step_id.to_string(),
                from: step.status.to_string(),
                to: StepStatus::Completed.to_string(),
                reason: "step is not awaiting completion".to_string(),
            });
        }

        let step = self.repo().get_step_execution(step_id).await?;
        let run = self.repo().get_run(&step.run_id).await?;
        let extra = (!step.inputs.is_null()).then(|| step.inputs.clone());
        let dispatch = self.prepare(run, step, extra.as_ref()).await?;
        let output = WorkerOutput {
            outputs,
            confidence: meta.confidence,
            insights: meta.insights,
            side_effects: meta.side_effects,
            cost: 0.0,
        };
        let report = self
            .finish(&dispatch, output, &meta.actor, None, Vec::new())
            .await?;
        if report.status == StepStatus::Completed {
            let closed = self.repo().close_human_tasks(step_id, &meta.actor).await?;
            debug!(step_id, closed, "Closed human tasks");
        }
        self.step_finished(&dispatch, &report).await;
        Ok(report)
    }

    async fn step_finished(&self, dispatch: &StepDispatch, report: &StepReport) {
        for middleware in self.middleware() {
            if let Err(e) = middleware.step_finished(dispatch, report).await {
                warn!(middleware = middleware.name(), error = %e, "step_finished hook failed");
            }
        }
        self.advance_logged(&dispatch.run.id).await;
    }

    fn middleware(&self) -> Vec<Arc<dyn ValidationMiddleware>> {
        self.inner.middleware.read().clone()
    }

    async fn gate_before(&self, dispatch: &StepDispatch) -> PreDispatch {
        let mut warnings = Vec::new();
        let mut replaced = None;
        let mut current = dispatch.clone();
        for middleware in self.middleware() {
            match middleware.before_dispatch(&current).await {
                Ok(PreDispatch::Proceed { inputs, warnings: w }) => {
                    warnings.extend(w);
                    if let Some(inputs) = inputs {
                        current.context = ExecutionContext::from_inputs(&inputs);
                        current.inputs = inputs.clone();
                        replaced = Some(inputs);
                    }
                }
                Ok(block @ PreDispatch::Block { .. }) => return block,
                Err(e) => {
                    return PreDispatch::Block {
                        reasons: vec![format!("{}: {e}", middleware.name())],
                    };
                }
            }
        }
        PreDispatch::Proceed {
            inputs: replaced,
            warnings,
        }
    }

    async fn gate_after(&self, dispatch: &StepDispatch, outputs: &Value) -> Verdict {
        let mut warnings = Vec::new();
        let mut current = outputs.clone();
        let mut replaced = false;
        for middleware in self.middleware() {
            match middleware.after_dispatch(dispatch, &current).await {
                Ok(Verdict::Accept { warnings: w, data }) => {
                    warnings.extend(w);
                    if let Some(data) = data {
                        current = data;
                        replaced = true;
                    }
                }
                Ok(reject @ Verdict::Reject { .. }) => return reject,
                Err(e) => {
                    return Verdict::Reject {
                        reasons: vec![format!("{}: {e}", middleware.name())],
                    };
                }
            }
        }
        Verdict::Accept {
            warnings,
            data: replaced.then_some(current),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Run advancement
    // ─────────────────────────────────────────────────────────────────────

    async fn advance_logged(&self, run_id: &str) {
        if let Err(e) = self.advance_run(run_id).await {
            warn!(run_id, error = %e, "Run advancement failed");
        }
    }

    /// Skip work stranded behind a terminal failure, unlock queued steps,
    /// refresh progress, and finish the run when every step is terminal.
    pub async fn advance_run(&self, run_id: &str) -> Result<()> {
        let settle = self.inner.settle.lock().await;
        let repo = self.repo();
        let run = repo.get_run(run_id).await?;
        if run.status != RunStatus::InProgress {
            return Ok(());
        }
        let machine = &self.inner.machine;
        let mut steps = repo.run_steps(run_id).await?;

        if let Some(failed_at) = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.sequence)
            .min()
        {
            for step in steps
                .iter()
                .filter(|s| s.sequence > failed_at && !s.status.is_terminal())
            {
                machine
                    .transition(
                        EntityKind::Step,
                        &step.id,
                        StepStatus::Skipped.as_str(),
                        TransitionContext::new().because("an earlier step failed"),
                    )
                    .await?;
            }
            steps = repo.run_steps(run_id).await?;
        }

        let unlock: Vec<Id> = scheduler::unlockable(&steps)
            .into_iter()
            .map(|s| s.id.clone())
            .collect();
        for step_id in &unlock {
            machine
                .transition(
                    EntityKind::Step,
                    step_id,
                    StepStatus::Pending.as_str(),
                    TransitionContext::new().because("prerequisites met"),
                )
                .await?;
        }
        if !unlock.is_empty() {
            steps = repo.run_steps(run_id).await?;
            self.nudge();
        }

        let progress = RunProgress::from_steps(&steps);
        repo.update_run(run_id, object(json!({ "progress": progress })))
            .await?;
        drop(settle);

        if !progress.all_terminal() {
            return Ok(());
        }
        if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
            let detail = failed
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "failed".to_string());
            self.fail_run(run_id, &format!("step '{}' failed: {detail}", failed.name))
                .await?;
        } else if self.inner.config.auto_complete_runs {
            match self.complete_run(run_id, inputs::merged_outputs(&steps)).await {
                Ok(_) | Err(EngineError::ContractViolation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Runs
    // ─────────────────────────────────────────────────────────────────────

    /// Create a run, start it, and lay out its step executions.
    pub async fn start_run(
        &self,
        playbook_id: &str,
        inputs: Value,
        options: RunOptions,
    ) -> Result<PlaybookRun> {
        let repo = self.repo();
        let playbook = repo.get_playbook(playbook_id).await?;
        let run = repo
            .create_run(&PlaybookRun {
                id: Id::new(),
                organization_id: playbook.organization_id.clone(),
                playbook_id: playbook_id.to_string(),
                status: RunStatus::Queued,
                inputs,
                outputs: None,
                priority: options.priority,
                correlation_id: options
                    .correlation_id
                    .unwrap_or_else(playbook_types::new_id),
                progress: RunProgress::default(),
                cost: 0.0,
                ai_confidence: None,
                ai_insights: Vec::new(),
                failure_reason: None,
                validation_errors: Vec::new(),
                created_by: Some(options.actor.clone()),
                started_at: None,
                completed_at: None,
                blocked_at: None,
                escalate_at: None,
            })
            .await?;

        if let Err(e) = self
            .inner
            .machine
            .transition(
                EntityKind::Run,
                &run.id,
                RunStatus::InProgress.as_str(),
                TransitionContext::new().by(options.actor.clone()),
            )
            .await
        {
            warn!(run_id = %run.id, error = %e, "Run could not start");
            if let Err(cancel) = self.cancel_run(&run.id, &e.to_string()).await {
                warn!(run_id = %run.id, error = %cancel, "Failed to cancel unstarted run");
            }
            return Err(e);
        }

        let run = repo.get_run(&run.id).await?;
        let definitions = repo.steps(playbook_id).await?;
        let first = definitions.iter().map(|d| d.sequence).min();
        for definition in &definitions {
            let status = if Some(definition.sequence) == first && definition.depends_on.is_empty() {
                StepStatus::Pending
            } else {
                StepStatus::Queued
            };
            repo.create_step_execution(&StepExecution::from_definition(definition, &run, status))
                .await?;
        }
        let progress = RunProgress {
            total_steps: definitions.len() as u32,
            ..Default::default()
        };
        repo.update_run(&run.id, object(json!({ "progress": progress })))
            .await?;
        info!(
            run_id = %run.id,
            playbook_id,
            steps = definitions.len(),
            correlation_id = %run.correlation_id,
            "Run started"
        );
        self.nudge();
        repo.get_run(&run.id).await
    }

    /// Gate the outputs through the middleware, then finalize.
    ///
    /// Rejected outputs fail the run. A run that is not in progress or still
    /// has open steps is left untouched and `TransitionNotAllowed` returned.
    pub async fn complete_run(&self, run_id: &str, outputs: Value) -> Result<PlaybookRun> {
        let run = self.repo().get_run(run_id).await?;
        let steps = self.repo().run_steps(run_id).await?;
        let open = steps.iter().filter(|s| !s.status.is_terminal()).count();
        if run.status != RunStatus::InProgress || open > 0 {
            return Err(EngineError::TransitionNotAllowed {
                kind: EntityKind::Run,
                entity_id: run_id.to_string(),
                from: run.status.to_string(),
                to: RunStatus::Completed.to_string(),
                reason: if open > 0 {
                    format!("{open} steps have not finished")
                } else {
                    "run is not in progress".to_string()
                },
            });
        }
        let mut outputs = outputs;
        for middleware in self.middleware() {
            let verdict = middleware
                .before_run_completion(&run, &outputs)
                .await
                .unwrap_or_else(|e| Verdict::Reject {
                    reasons: vec![format!("{}: {e}", middleware.name())],
                });
            match verdict {
                Verdict::Accept { data, .. } => {
                    if let Some(data) = data {
                        outputs = data;
                    }
                }
                Verdict::Reject { reasons } => {
                    let message = format!("Run output validation failed: {}", reasons.join("; "));
                    self.reject_run(run_id, reasons).await?;
                    return Err(EngineError::ContractViolation(message));
                }
            }
        }
        self.finalize_run(run_id, outputs).await
    }

    /// Record AI aggregates and move the run to completed. The output
    /// contract is still enforced by the transition guard.
    pub async fn finalize_run(&self, run_id: &str, outputs: Value) -> Result<PlaybookRun> {
        let repo = self.repo();
        let run = repo.get_run(run_id).await?;
        let steps = repo.run_steps(run_id).await?;
        let insights = &self.inner.insights;
        let now = playbook_types::now();
        let confidence = insights.run_confidence(&steps);
        let notes = insights.run_insights(&run, &steps, now);

        let context = TransitionContext::new()
            .by("orchestrator")
            .with_data("outputs", outputs.clone())
            .with_patch("outputs", outputs)
            .with_patch("ai_confidence", json!(confidence))
            .with_patch("ai_insights", json!(notes));
        match self
            .inner
            .machine
            .transition(EntityKind::Run, run_id, RunStatus::Completed.as_str(), context)
            .await
        {
            Ok(_) => {}
            Err(EngineError::TransitionNotAllowed { reason, .. })
                if run.status == RunStatus::InProgress =>
            {
                self.reject_run(run_id, vec![reason.clone()]).await?;
                return Err(EngineError::ContractViolation(reason));
            }
            Err(e) => return Err(e),
        }
        let run = repo.get_run(run_id).await?;
        info!(run_id, confidence = ?run.ai_confidence, "Run completed");
        self.run_finished(&run).await;
        Ok(run)
    }

    /// Fail a run whose outputs were rejected.
    async fn reject_run(&self, run_id: &str, errors: Vec<String>) -> Result<()> {
        warn!(run_id, errors = ?errors, "Run outputs rejected");
        self.inner
            .machine
            .transition(
                EntityKind::Run,
                run_id,
                RunStatus::Failed.as_str(),
                TransitionContext::new()
                    .by("orchestrator")
                    .because("run output validation failed")
                    .with_patch("failure_reason", "run output validation failed")
                    .with_patch("validation_errors", json!(errors)),
            )
            .await?;
        let run = self.repo().get_run(run_id).await?;
        self.run_finished(&run).await;
        Ok(())
    }

    pub async fn fail_run(&self, run_id: &str, reason: &str) -> Result<()> {
        self.inner
            .machine
            .transition(
                EntityKind::Run,
                run_id,
                RunStatus::Failed.as_str(),
                TransitionContext::new()
                    .by("orchestrator")
                    .because(reason)
                    .with_patch("failure_reason", reason),
            )
            .await?;
        warn!(run_id, reason, "Run failed");
        let run = self.repo().get_run(run_id).await?;
        self.run_finished(&run).await;
        Ok(())
    }

    pub async fn cancel_run(&self, run_id: &str, reason: &str) -> Result<()> {
        self.inner
            .machine
            .transition(
                EntityKind::Run,
                run_id,
                RunStatus::Cancelled.as_str(),
                TransitionContext::new().by("orchestrator").because(reason),
            )
            .await?;
        info!(run_id, reason, "Run cancelled");
        Ok(())
    }

    pub async fn block_run(&self, run_id: &str, reason: &str) -> Result<()> {
        self.inner
            .machine
            .transition(
                EntityKind::Run,
                run_id,
                RunStatus::Blocked.as_str(),
                TransitionContext::new().by("orchestrator").because(reason),
            )
            .await?;
        Ok(())
    }

    pub async fn resume_run(&self, run_id: &str) -> Result<()> {
        self.inner
            .machine
            .transition(
                EntityKind::Run,
                run_id,
                RunStatus::InProgress.as_str(),
                TransitionContext::new().by("orchestrator").because("resumed"),
            )
            .await?;
        self.nudge();
        Ok(())
    }

    async fn run_finished(&self, run: &PlaybookRun) {
        for middleware in self.middleware() {
            if let Err(e) = middleware.run_finished(run).await {
                warn!(middleware = middleware.name(), error = %e, "run_finished hook failed");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Signals
    // ─────────────────────────────────────────────────────────────────────

    pub async fn handle_signal(&self, signal: Signal) -> Result<()> {
        debug!(signal = ?signal.signal_type, "Signal received");
        match signal.signal_type {
            SignalType::StepReady => self.poll_logged().await,
            SignalType::ExternalUpdate => {
                let (Some(step_id), Some(name)) =
                    (signal.payload_str("step_id"), signal.payload_str("signal"))
                else {
                    warn!(payload = %signal.payload, "External update without step_id and signal");
                    return Ok(());
                };
                let step = self.repo().get_step_execution(step_id).await?;
                if !step.received_signals.iter().any(|s| s == name) {
                    let mut received = step.received_signals.clone();
                    received.push(name.to_string());
                    self.repo()
                        .update_step_execution(step_id, object(json!({ "received_signals": received })))
                        .await?;
                    info!(step_id, signal = name, "External signal recorded");
                }
                self.poll_logged().await;
            }
            SignalType::TimeoutWarning | SignalType::EscalationRequired => {
                warn!(signal = ?signal.signal_type, payload = %signal.payload, "Escalation signal");
                let block = signal
                    .payload
                    .get("block")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if block && let Some(run_id) = signal.payload_str("run_id") {
                    self.block_run(run_id, "escalation requested").await?;
                }
            }
            SignalType::PauseRequested => {
                if let Some(run_id) = signal.payload_str("run_id") {
                    self.block_run(run_id, "pause requested").await?;
                    info!(run_id, "Run paused");
                }
            }
            SignalType::ResumeRequested => {
                if let Some(run_id) = signal.payload_str("run_id") {
                    self.resume_run(run_id).await?;
                    info!(run_id, "Run resumed");
                }
            }
        }
        Ok(())
    }
}

fn object(value: Value) -> playbook_types::Metadata {
    crate::repository::object(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use playbook_contracts::{INPUT_CONTRACT, OUTPUT_CONTRACT};
    use playbook_store::MemoryStore;
    use playbook_types::StepDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepWorker for Echo {
        async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerOutcome::Completed(WorkerOutput::new(json!({
                "echo": dispatch.step.name,
            }))))
        }
    }

    async fn setup(steps: &[(&str, u32)]) -> (Orchestrator, Arc<Echo>, Id) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::builder()
            .with_store(store)
            .with_config(OrchestratorConfig {
                organization_id: "org-1".into(),
                ..Default::default()
            })
            .with_worker(WorkerType::System, echo.clone())
            .build()
            .unwrap();
        let repo = orchestrator.repo();
        let playbook = repo
            .create_playbook("org-1", "PB-ECHO", "Echo", "")
            .await
            .unwrap();
        repo.set_contract(&playbook.id, INPUT_CONTRACT, json!({"type": "object"}))
            .await
            .unwrap();
        repo.set_contract(&playbook.id, OUTPUT_CONTRACT, json!({"type": "object"}))
            .await
            .unwrap();
        for (name, sequence) in steps {
            repo.add_step(&playbook.id, StepDefinition::new(*name, *sequence, WorkerType::System))
                .await
                .unwrap();
        }
        orchestrator
            .machine()
            .transition(
                EntityKind::Playbook,
                &playbook.id,
                "published",
                TransitionContext::new(),
            )
            .await
            .unwrap();
        (orchestrator, echo, playbook.id)
    }

    #[tokio::test]
    async fn test_build_requires_store() {
        let err = Orchestrator::builder().build().err().unwrap();
        assert_eq!(err.code(), "SETUP_ERROR");
    }

    #[tokio::test]
    async fn test_start_run_lays_out_steps() {
        let (orchestrator, _, playbook_id) = setup(&[("a", 1), ("b", 2)]).await;
        let run = orchestrator
            .start_run(&playbook_id, json!({}), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.progress.total_steps, 2);
        assert!(run.started_at.is_some());

        let steps = orchestrator.repo().run_steps(&run.id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert_eq!(steps[1].status, StepStatus::Queued);
    }

    #[tokio::test]
    async fn test_drain_runs_to_completion() {
        let (orchestrator, echo, playbook_id) = setup(&[("a", 1), ("b", 2), ("c", 3)]).await;
        let mut events = orchestrator.subscribe();
        let run = orchestrator
            .start_run(&playbook_id, json!({}), RunOptions::default())
            .await
            .unwrap();

        orchestrator.drain().await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 3);

        let run = orchestrator.repo().get_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.progress.completed_steps, 3);
        assert_eq!(run.outputs, Some(json!({"echo": "c"})));

        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::StepCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn test_capacity_caps_dispatch() {
        let (orchestrator, _, playbook_id) = setup(&[("a", 1), ("b", 1), ("c", 1)]).await;
        orchestrator
            .start_run(&playbook_id, json!({}), RunOptions::default())
            .await
            .unwrap();
        let executable = orchestrator.find_executable_steps().await.unwrap();
        assert_eq!(executable.len(), 3);

        let _held: Vec<_> = ["x", "y", "z", "w", "v", "u", "t", "s"]
            .iter()
            .filter_map(|id| orchestrator.occupy(id))
            .collect();
        // 10 slots, 8 held
        assert_eq!(orchestrator.find_executable_steps().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (orchestrator, _, _) = setup(&[("a", 1)]).await;
        orchestrator.start();
        orchestrator.start();
        assert!(orchestrator.is_running());
        orchestrator.stop().await;
        orchestrator.stop().await;
        assert!(!orchestrator.is_running());
        orchestrator.start();
        assert!(orchestrator.is_running());
        orchestrator.stop().await;
    }

    #[tokio::test]
    async fn test_external_signal_unblocks_step() {
        let (orchestrator, echo, playbook_id) = setup(&[("a", 1)]).await;
        let definitions = orchestrator.repo().steps(&playbook_id).await.unwrap();
        let run = orchestrator
            .start_run(&playbook_id, json!({}), RunOptions::default())
            .await
            .unwrap();
        let step = orchestrator.repo().run_steps(&run.id).await.unwrap().remove(0);
        assert_eq!(step.step_id, definitions[0].id);
        orchestrator
            .repo()
            .update_step_execution(&step.id, object(json!({"required_signals": ["docs"]})))
            .await
            .unwrap();

        orchestrator.drain().await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

        orchestrator
            .handle_signal(Signal::external_update(&step.id, "docs"))
            .await
            .unwrap();
        let run = orchestrator
            .run_until_settled(&run.id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_signals() {
        let (orchestrator, echo, playbook_id) = setup(&[("a", 1)]).await;
        let run = orchestrator
            .start_run(&playbook_id, json!({}), RunOptions::default())
            .await
            .unwrap();

        orchestrator
            .handle_signal(Signal::new(SignalType::PauseRequested, json!({"run_id": run.id})))
            .await
            .unwrap();
        let paused = orchestrator.repo().get_run(&run.id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Blocked);
        assert!(paused.escalate_at.is_some());
        orchestrator.drain().await.unwrap();
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);

        orchestrator
            .handle_signal(Signal::new(SignalType::ResumeRequested, json!({"run_id": run.id})))
            .await
            .unwrap();
        orchestrator.drain().await.unwrap();
        let run = orchestrator.repo().get_run(&run.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.escalate_at.is_none());
    }
}
