//! Playbook execution engine.
//!
//! Runs multi-step business playbooks over a generic persistence adapter:
//! a state machine that owns every lifecycle transition, a polling
//! orchestrator that dispatches steps to human, AI and HTTP workers, and a
//! contract-aware layer that gates each boundary with schema and policy
//! checks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ContractAwareOrchestrator                                   │
//! │   └─ ContractGate (ValidationMiddleware) ─► compliance audit │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Orchestrator                                                │
//! │   poll loop · scheduler · input resolution · WorkerRegistry  │
//! │                    human │ ai │ http                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  StateMachine                                                │
//! │   rules (guards + post-actions) · audit trail · claims       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  PlaybookRepository ─► PersistenceAdapter (memory │ sqlite)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audit;
pub mod config;
pub mod contract_aware;
pub mod dispatch;
pub mod error;
pub mod inputs;
pub mod middleware;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod workers;

pub use audit::{ComplianceAuditor, ComplianceEvent};
pub use config::{build_ai_backend, build_store};
pub use contract_aware::{
    ContractAwareOrchestrator, ContractGate, RunCompletionResult, StepExecutionResult,
};
pub use dispatch::{Actor, ExecutionContext, StepDispatch};
pub use error::{EngineError, Result};
pub use middleware::{PreDispatch, ValidationMiddleware, Verdict};
pub use orchestrator::{
    CompletionMeta, Orchestrator, OrchestratorBuilder, OrchestratorConfig, RunOptions, StepReport,
};
pub use repository::{PlaybookRepository, RecordState};
pub use state_machine::{
    GuardVerdict, MachineSettings, PostAction, StateMachine, TransitionContext,
    TransitionDecision, TransitionGuard, TransitionRequest, TransitionRule,
};
pub use workers::{
    AiStepDefaults, AiStepWorker, HttpServiceWorker, HttpWorkerConfig, HumanTaskWorker,
    StepWorker, WorkerOutcome, WorkerOutput, WorkerRegistry,
};
