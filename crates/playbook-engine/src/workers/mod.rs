//! Step execution strategies, one per worker type.
//!
//! ```text
//! WorkerRegistry ── WorkerType ──► Arc<dyn StepWorker>
//!   system / external ─► HttpServiceWorker   (POST to a service endpoint)
//!   ai                ─► AiStepWorker        (AiBackend::process)
//!   human             ─► HumanTaskWorker     (task record, completes later)
//! ```

mod ai;
mod http;
mod human;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use playbook_types::{Id, Timestamp, WorkerType};

use crate::dispatch::StepDispatch;
use crate::error::Result;

pub use ai::{AiStepDefaults, AiStepWorker};
pub use http::{HttpServiceWorker, HttpWorkerConfig};
pub use human::HumanTaskWorker;

/// How a worker finished with a step.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The step produced its outputs.
    Completed(WorkerOutput),
    /// Work continues out of band (a person is on it); the step waits for
    /// an explicit completion call.
    Waiting {
        assignee: Option<String>,
        due_at: Timestamp,
        task_id: Id,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerOutput {
    pub outputs: Value,
    pub confidence: Option<f64>,
    pub insights: Option<String>,
    pub side_effects: Vec<String>,
    pub cost: f64,
}

impl WorkerOutput {
    pub fn new(outputs: Value) -> Self {
        Self {
            outputs,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StepWorker: Send + Sync {
    async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome>;
}

/// Lookup table from worker type to strategy.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerType, Arc<dyn StepWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_type: WorkerType, worker: Arc<dyn StepWorker>) {
        self.workers.insert(worker_type, worker);
    }

    pub fn with(mut self, worker_type: WorkerType, worker: Arc<dyn StepWorker>) -> Self {
        self.register(worker_type, worker);
        self
    }

    pub fn get(&self, worker_type: WorkerType) -> Option<Arc<dyn StepWorker>> {
        self.workers.get(&worker_type).cloned()
    }

    pub fn contains(&self, worker_type: WorkerType) -> bool {
        self.workers.contains_key(&worker_type)
    }

    pub fn registered(&self) -> Vec<WorkerType> {
        WorkerType::ALL
            .into_iter()
            .filter(|w| self.contains(*w))
            .collect()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.registered())
            .finish()
    }
}

/// Outputs that carry nothing.
pub(crate) fn is_empty_output(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
