//! CLI command handlers.

use std::path::PathBuf;

use anyhow::Result;
use playbook_config::PlaybookConfig;
use playbook_engine::Orchestrator;

pub mod config;
pub mod run;
pub mod validate;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Resolved configuration.
    pub config: PlaybookConfig,
    /// Config files that contributed to `config`.
    pub sources: Vec<PathBuf>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(playbook_engine::OrchestratorBuilder::from_config(&self.config)?.build()?)
    }
}
