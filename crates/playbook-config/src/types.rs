//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [orchestrator]   # poll loop, concurrency, reaper
//! [retry]          # engine-wide retry defaults
//! [workers]        # HTTP worker endpoint and auth
//! [ai]             # AI backend selection and model defaults
//! [contracts]      # normalization switches
//! [sla]            # business-hours accounting
//! [storage]        # record store backend
//! [logging]        # log level and JSON file output
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (project-local
/// overrides) can be loaded and merged. Use the accessor methods to get a
/// section with defaults filled in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookConfig {
    pub orchestrator: Option<OrchestratorSection>,
    pub retry: Option<RetrySection>,
    pub workers: Option<WorkersSection>,
    pub ai: Option<AiSection>,
    pub contracts: Option<ContractsSection>,
    pub sla: Option<SlaSection>,
    pub storage: Option<StorageSection>,
    pub logging: Option<LoggingSection>,
}

impl PlaybookConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole, never merged field by field.
    pub fn merge(&mut self, other: PlaybookConfig) {
        if other.orchestrator.is_some() {
            self.orchestrator = other.orchestrator;
        }
        if other.retry.is_some() {
            self.retry = other.retry;
        }
        if other.workers.is_some() {
            self.workers = other.workers;
        }
        if other.ai.is_some() {
            self.ai = other.ai;
        }
        if other.contracts.is_some() {
            self.contracts = other.contracts;
        }
        if other.sla.is_some() {
            self.sla = other.sla;
        }
        if other.storage.is_some() {
            self.storage = other.storage;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    pub fn orchestrator(&self) -> OrchestratorSection {
        self.orchestrator.clone().unwrap_or_default()
    }

    pub fn retry(&self) -> RetrySection {
        self.retry.clone().unwrap_or_default()
    }

    pub fn workers(&self) -> WorkersSection {
        self.workers.clone().unwrap_or_default()
    }

    pub fn ai(&self) -> AiSection {
        self.ai.clone().unwrap_or_default()
    }

    pub fn contracts(&self) -> ContractsSection {
        self.contracts.clone().unwrap_or_default()
    }

    pub fn sla(&self) -> SlaSection {
        self.sla.clone().unwrap_or_default()
    }

    pub fn storage(&self) -> StorageSection {
        self.storage.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let orchestrator = self.orchestrator();
        if orchestrator.max_concurrent_steps == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.max_concurrent_steps",
                "must be at least 1",
            ));
        }
        if orchestrator.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.retry().max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        let sla = self.sla();
        if !(sla.business_hours_per_day > 0.0 && sla.business_hours_per_day <= 24.0) {
            return Err(ConfigError::invalid(
                "sla.business_hours_per_day",
                "must be in (0, 24]",
            ));
        }
        let ai = self.ai();
        if !(0.0..=1.0).contains(&ai.default_confidence) {
            return Err(ConfigError::invalid(
                "ai.default_confidence",
                "must be between 0 and 1",
            ));
        }
        if self.storage().backend == StorageBackend::Sqlite && self.storage().path.is_none() {
            return Err(ConfigError::invalid(
                "storage.path",
                "required when backend = \"sqlite\"",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Poll loop settings.
///
/// ```toml
/// [orchestrator]
/// organization_id = "acme"
/// poll_interval_ms = 5000
/// max_concurrent_steps = 10
/// reaper_enabled = true
/// stale_step_grace_secs = 300
/// max_active_runs = 50          # optional
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Tenant whose runs this orchestrator instance polls.
    pub organization_id: String,
    pub poll_interval_ms: u64,
    pub max_concurrent_steps: usize,
    /// Requeue steps stuck in `running` past their SLA plus grace.
    pub reaper_enabled: bool,
    pub stale_step_grace_secs: u64,
    /// Runs allowed in progress at once; unlimited when unset.
    pub max_active_runs: Option<usize>,
    /// Complete a run as soon as its last step finishes.
    pub auto_complete_runs: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            organization_id: "default".to_string(),
            poll_interval_ms: 5000,
            max_concurrent_steps: 10,
            reaper_enabled: true,
            stale_step_grace_secs: 300,
            max_active_runs: None,
            auto_complete_runs: true,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Retry defaults for steps that carry no retry policy of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_seconds: Vec<u64>,
    /// Delay used once an attempt count outruns the backoff schedule.
    pub fallback_backoff_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_seconds: vec![5, 30, 120],
            fallback_backoff_secs: 60,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Workers
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP worker settings for system and external steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Endpoint used when a step does not name its own.
    pub service_endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    pub api_token_env: String,
    pub default_timeout_secs: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            service_endpoint: None,
            api_token_env: "PLAYBOOK_WORKER_TOKEN".to_string(),
            default_timeout_secs: 300,
        }
    }
}

impl WorkersSection {
    /// Bearer token from the environment, if set.
    pub fn api_token(&self) -> Option<String> {
        std::env::var(&self.api_token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AI
// ─────────────────────────────────────────────────────────────────────────────

/// Which AI backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiBackendKind {
    /// Deterministic canned responses; no network access.
    #[default]
    Mock,
    Anthropic,
}

/// AI backend settings.
///
/// ```toml
/// [ai]
/// backend = "anthropic"
/// model = "claude-sonnet-4-5"
/// api_key_env = "ANTHROPIC_API_KEY"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSection {
    pub backend: AiBackendKind,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub api_key_env: String,
    /// Override the provider's API base URL.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    /// Confidence recorded when the backend reports none.
    pub default_confidence: f64,
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            backend: AiBackendKind::Mock,
            model: "claude-sonnet-4-5".to_string(),
            temperature: 0.2,
            max_tokens: 2048,
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            timeout_secs: 120,
            default_confidence: 0.85,
        }
    }
}

impl AiSection {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::ApiKeyNotFound {
                backend: format!("{:?}", self.backend).to_lowercase(),
                env_var: self.api_key_env.clone(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Contracts & SLA
// ─────────────────────────────────────────────────────────────────────────────

/// Normalization switches applied before schema validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsSection {
    pub coerce_types: bool,
    pub remove_additional: bool,
    pub use_defaults: bool,
}

impl Default for ContractsSection {
    fn default() -> Self {
        Self {
            coerce_types: true,
            remove_additional: true,
            use_defaults: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaSection {
    /// Working hours per day for business-hours-only SLA accounting.
    pub business_hours_per_day: f64,
    /// How long a blocked run may wait before it is due for escalation.
    pub escalation_hours: u64,
}

impl Default for SlaSection {
    fn default() -> Self {
        Self {
            business_hours_per_day: 8.0,
            escalation_hours: 24,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage & Logging
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: StorageBackend,
    /// Database file for the sqlite backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rolling JSON log files. Console only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
