//! Building engine components from a [`PlaybookConfig`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use playbook_ai::{AiResponse, AnthropicBackend, AnthropicConfig, InsightService, MockAiBackend, SharedAiBackend};
use playbook_config::{
    AiBackendKind, AiSection, ContractsSection, OrchestratorSection, PlaybookConfig,
    StorageBackend, StorageSection,
};
use playbook_contracts::{ContractValidationService, NormalizeOptions};
use playbook_store::{MemoryStore, SharedStore, SqliteStore};
use playbook_types::RetryPolicy;

use crate::error::{EngineError, Result};
use crate::orchestrator::{OrchestratorBuilder, OrchestratorConfig};
use crate::state_machine::MachineSettings;
use crate::workers::{AiStepDefaults, HttpWorkerConfig};

impl OrchestratorConfig {
    pub fn from_section(section: &OrchestratorSection) -> Self {
        Self {
            organization_id: section.organization_id.clone(),
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            max_concurrent_steps: section.max_concurrent_steps,
            reaper_enabled: section.reaper_enabled,
            stale_step_grace: Duration::from_secs(section.stale_step_grace_secs),
            auto_complete_runs: section.auto_complete_runs,
            ..Default::default()
        }
    }
}

impl MachineSettings {
    pub fn from_config(config: &PlaybookConfig) -> Self {
        let retry = config.retry();
        Self {
            max_active_runs: config.orchestrator().max_active_runs,
            escalation_after: i64::try_from(config.sla().escalation_hours)
                .ok()
                .and_then(chrono::TimeDelta::try_hours)
                .unwrap_or(chrono::TimeDelta::MAX),
            default_retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                backoff_seconds: retry.backoff_seconds,
            },
            fallback_backoff_secs: retry.fallback_backoff_secs,
        }
    }
}

fn normalize_options(section: &ContractsSection) -> NormalizeOptions {
    NormalizeOptions {
        coerce_types: section.coerce_types,
        remove_additional: section.remove_additional,
        use_defaults: section.use_defaults,
    }
}

pub fn build_store(section: &StorageSection) -> Result<SharedStore> {
    match section.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            let path = section.path.as_ref().ok_or_else(|| {
                EngineError::Setup("sqlite storage requires storage.path".to_string())
            })?;
            info!(path = %path.display(), "Opening sqlite store");
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

/// The mock backend answers every request with the same canned outputs.
pub fn build_ai_backend(section: &AiSection) -> Result<SharedAiBackend> {
    match section.backend {
        AiBackendKind::Mock => Ok(Arc::new(MockAiBackend::repeating(
            AiResponse::new(json!({ "summary": "mock analysis" }))
                .with_confidence(section.default_confidence),
        ))),
        AiBackendKind::Anthropic => {
            let mut config = AnthropicConfig::new(section.api_key()?)
                .with_timeout(Duration::from_secs(section.timeout_secs));
            if let Some(ref url) = section.base_url {
                config = config.with_base_url(url.clone());
            }
            Ok(Arc::new(AnthropicBackend::new(config)?))
        }
    }
}

impl OrchestratorBuilder {
    /// A builder wired from configuration: store, contract service, retry
    /// and escalation settings, AI backend, and HTTP workers when an
    /// endpoint is configured.
    pub fn from_config(config: &PlaybookConfig) -> Result<Self> {
        let store = build_store(&config.storage())?;
        let ai = config.ai();
        let contracts = ContractValidationService::new(store.clone())
            .with_options(normalize_options(&config.contracts()))
            .with_business_hours_per_day(config.sla().business_hours_per_day);

        let mut builder = OrchestratorBuilder::new()
            .with_store(store)
            .with_config(OrchestratorConfig::from_section(&config.orchestrator()))
            .with_settings(MachineSettings::from_config(config))
            .with_contracts(Arc::new(contracts))
            .with_insights(InsightService::new(ai.default_confidence))
            .with_ai_defaults(AiStepDefaults {
                model: ai.model.clone(),
                temperature: ai.temperature,
                max_tokens: ai.max_tokens,
            })
            .with_ai_backend(build_ai_backend(&ai)?);

        let workers = config.workers();
        if workers.service_endpoint.is_some() {
            builder = builder.with_http_workers(HttpWorkerConfig {
                default_endpoint: workers.service_endpoint.clone(),
                api_token: workers.api_token(),
                default_timeout: Duration::from_secs(workers.default_timeout_secs),
            });
        }
        Ok(builder)
    }
}
