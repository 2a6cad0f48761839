//! Hooks the orchestrator calls around each dispatch and at run completion.
//!
//! ```text
//! execute_step
//!   ├─ before_dispatch ──► Block ─► step failed (no retry)
//!   ├─ claim + worker
//!   ├─ after_dispatch  ──► Reject ─► step failed (no retry)
//!   └─ step_finished
//! complete_run
//!   ├─ before_run_completion ──► Reject ─► run failed
//!   └─ run_finished
//! ```
//!
//! Every method has a pass-through default, so an implementation overrides
//! only the hooks it cares about.

use async_trait::async_trait;
use serde_json::Value;

use playbook_types::PlaybookRun;

use crate::dispatch::StepDispatch;
use crate::error::Result;
use crate::orchestrator::StepReport;

/// Outcome of the pre-dispatch hook.
#[derive(Debug, Clone, PartialEq)]
pub enum PreDispatch {
    Proceed {
        /// Replacement inputs, e.g. after contract normalization.
        inputs: Option<Value>,
        warnings: Vec<String>,
    },
    Block {
        reasons: Vec<String>,
    },
}

impl PreDispatch {
    pub fn proceed() -> Self {
        PreDispatch::Proceed {
            inputs: None,
            warnings: Vec::new(),
        }
    }
}

/// Outcome of a post-dispatch or pre-completion hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept {
        warnings: Vec<String>,
        /// Replacement data (normalized outputs).
        data: Option<Value>,
    },
    Reject {
        reasons: Vec<String>,
    },
}

impl Verdict {
    pub fn accept() -> Self {
        Verdict::Accept {
            warnings: Vec::new(),
            data: None,
        }
    }
}

#[async_trait]
pub trait ValidationMiddleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before_dispatch(&self, _dispatch: &StepDispatch) -> Result<PreDispatch> {
        Ok(PreDispatch::proceed())
    }

    async fn after_dispatch(&self, _dispatch: &StepDispatch, _outputs: &Value) -> Result<Verdict> {
        Ok(Verdict::accept())
    }

    async fn step_finished(&self, _dispatch: &StepDispatch, _report: &StepReport) -> Result<()> {
        Ok(())
    }

    async fn before_run_completion(&self, _run: &PlaybookRun, _outputs: &Value) -> Result<Verdict> {
        Ok(Verdict::accept())
    }

    async fn run_finished(&self, _run: &PlaybookRun) -> Result<()> {
        Ok(())
    }
}
