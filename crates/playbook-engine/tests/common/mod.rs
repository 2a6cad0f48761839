//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use playbook_contracts::{INPUT_CONTRACT, OUTPUT_CONTRACT};
use playbook_engine::{
    Orchestrator, OrchestratorConfig, Result, StepDispatch, StepWorker, TransitionContext,
    WorkerOutcome, WorkerOutput,
};
use playbook_store::{MemoryStore, SharedStore};
use playbook_types::{EntityKind, Id, StepDefinition, WorkerType};

pub const ORG: &str = "org-1";

type Script = dyn Fn(&StepDispatch, usize) -> Result<WorkerOutcome> + Send + Sync;

/// A system worker driven by a closure. The second argument is how many
/// times the current step has been dispatched before.
pub struct ScriptedWorker {
    calls: Mutex<Vec<String>>,
    script: Box<Script>,
}

impl ScriptedWorker {
    pub fn new(
        script: impl Fn(&StepDispatch, usize) -> Result<WorkerOutcome> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        })
    }

    /// Answers every step with the given outputs.
    pub fn returning(outputs: Value) -> Arc<Self> {
        Self::new(move |_, _| Ok(WorkerOutcome::Completed(WorkerOutput::new(outputs.clone()))))
    }

    /// Step names in dispatch order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl StepWorker for ScriptedWorker {
    async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome> {
        let previous = {
            let mut calls = self.calls.lock();
            let previous = calls.iter().filter(|n| **n == dispatch.step.name).count();
            calls.push(dispatch.step.name.clone());
            previous
        };
        (self.script)(dispatch, previous)
    }
}

pub fn orchestrator(worker: Arc<ScriptedWorker>) -> Orchestrator {
    let store: SharedStore = Arc::new(MemoryStore::new());
    Orchestrator::builder()
        .with_store(store)
        .with_config(OrchestratorConfig {
            organization_id: ORG.into(),
            ..Default::default()
        })
        .with_worker(WorkerType::System, worker)
        .build()
        .unwrap()
}

pub fn system_step(name: &str, sequence: u32) -> StepDefinition {
    StepDefinition::new(name, sequence, WorkerType::System)
}

/// Create and publish a playbook. Returns its id and the stored step
/// definitions in sequence order.
pub async fn publish(
    orchestrator: &Orchestrator,
    steps: Vec<StepDefinition>,
    output_contract: Value,
) -> (Id, Vec<StepDefinition>) {
    let repo = orchestrator.repo();
    let playbook = repo
        .create_playbook(ORG, "PB-TEST", "Test playbook", "")
        .await
        .unwrap();
    repo.set_contract(&playbook.id, INPUT_CONTRACT, json!({"type": "object"}))
        .await
        .unwrap();
    repo.set_contract(&playbook.id, OUTPUT_CONTRACT, output_contract)
        .await
        .unwrap();
    for step in steps {
        repo.add_step(&playbook.id, step).await.unwrap();
    }
    orchestrator
        .machine()
        .transition(
            EntityKind::Playbook,
            &playbook.id,
            "published",
            TransitionContext::new().by("author"),
        )
        .await
        .unwrap();
    let steps = repo.steps(&playbook.id).await.unwrap();
    (playbook.id, steps)
}
