//! AI steps: prompt a model with the step inputs and its output contract.

use async_trait::async_trait;
use serde_json::Value;

use playbook_ai::{AiRequest, InsightService, SharedAiBackend};
use playbook_contracts::{INPUT_CONTRACT, OUTPUT_CONTRACT};

use super::{StepWorker, WorkerOutcome, WorkerOutput};
use crate::dispatch::StepDispatch;
use crate::error::Result;
use crate::repository::PlaybookRepository;

/// Model settings for steps that do not name their own.
#[derive(Debug, Clone)]
pub struct AiStepDefaults {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AiStepDefaults {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            temperature: 0.2,
            max_tokens: 2048,
        }
    }
}

pub struct AiStepWorker {
    backend: SharedAiBackend,
    insights: InsightService,
    defaults: AiStepDefaults,
    repo: Option<PlaybookRepository>,
}

impl AiStepWorker {
    pub fn new(backend: SharedAiBackend, defaults: AiStepDefaults, insights: InsightService) -> Self {
        Self {
            backend,
            insights,
            defaults,
            repo: None,
        }
    }

    /// Attach the step contracts to each request.
    pub fn with_repository(mut self, repo: PlaybookRepository) -> Self {
        self.repo = Some(repo);
        self
    }

    async fn schema(&self, step_id: &str, field: &str) -> Result<Option<Value>> {
        let Some(ref repo) = self.repo else {
            return Ok(None);
        };
        Ok(repo.contract(step_id, field).await?.map(|stored| match stored {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            other => other,
        }))
    }

    fn build_request(&self, dispatch: &StepDispatch, input: Option<Value>, output: Option<Value>) -> AiRequest {
        let settings = dispatch.definition.ai.clone().unwrap_or_default();
        AiRequest::new(
            settings.model.unwrap_or_else(|| self.defaults.model.clone()),
            prompt(dispatch),
        )
        .with_schemas(input, output)
        .with_temperature(settings.temperature.unwrap_or(self.defaults.temperature))
        .with_max_tokens(settings.max_tokens.unwrap_or(self.defaults.max_tokens))
    }
}

fn prompt(dispatch: &StepDispatch) -> String {
    let definition = &dispatch.definition;
    let mut text = format!("Step: {}\n", definition.name);
    if !definition.description.is_empty() {
        text.push_str(&format!("Task: {}\n", definition.description));
    }
    let inputs =
        serde_json::to_string_pretty(&dispatch.inputs).unwrap_or_else(|_| dispatch.inputs.to_string());
    text.push_str("\nInputs:\n");
    text.push_str(&inputs);
    text
}

#[async_trait]
impl StepWorker for AiStepWorker {
    async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome> {
        let input_schema = self.schema(&dispatch.step.step_id, INPUT_CONTRACT).await?;
        let output_schema = self.schema(&dispatch.step.step_id, OUTPUT_CONTRACT).await?;
        let request = self.build_request(dispatch, input_schema, output_schema);
        tracing::debug!(
            step_id = %dispatch.step.id,
            model = %request.model,
            backend = self.backend.name(),
            "Dispatching AI step"
        );

        let response = self.backend.process(request).await?;
        let confidence = self.insights.confidence(&response.outputs, response.confidence);
        tracing::debug!(
            step_id = %dispatch.step.id,
            confidence,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "AI step answered"
        );
        Ok(WorkerOutcome::Completed(WorkerOutput {
            outputs: response.outputs,
            confidence: Some(confidence),
            insights: response.insights,
            side_effects: Vec::new(),
            cost: 0.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ExecutionContext;
    use playbook_ai::{AiResponse, MockAiBackend};
    use playbook_types::{
        AiStepSettings, PlaybookRun, StepDefinition, StepExecution, StepStatus, WorkerType,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn dispatch(ai: Option<AiStepSettings>) -> StepDispatch {
        let mut definition = StepDefinition::new("score_lead", 2, WorkerType::Ai);
        definition.description = "Score the lead".into();
        definition.ai = ai;
        let run: PlaybookRun = serde_json::from_value(json!({
            "id": "run-1",
            "organization_id": "org-1",
            "playbook_id": "pb-1"
        }))
        .unwrap();
        let step = StepExecution::from_definition(&definition, &run, StepStatus::Running);
        StepDispatch {
            run,
            step,
            definition,
            inputs: json!({"company": "Acme"}),
            context: ExecutionContext::default(),
            completed: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_uses_step_model_settings() {
        let backend = Arc::new(MockAiBackend::repeating(AiResponse::new(json!({"score": 7}))));
        let worker = AiStepWorker::new(
            backend.clone(),
            AiStepDefaults::default(),
            InsightService::new(0.85),
        );
        let outcome = worker
            .execute(&dispatch(Some(AiStepSettings {
                model: Some("small-model".into()),
                temperature: Some(0.0),
                max_tokens: None,
            })))
            .await
            .unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "small-model");
        assert_eq!(requests[0].temperature, 0.0);
        assert_eq!(requests[0].max_tokens, 2048);
        assert!(requests[0].prompt.contains("Score the lead"));
        assert!(requests[0].prompt.contains("Acme"));

        let WorkerOutcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output.outputs, json!({"score": 7}));
        assert_eq!(output.confidence, Some(0.85));
    }

    #[tokio::test]
    async fn test_backend_confidence_wins() {
        let backend = Arc::new(MockAiBackend::repeating(
            AiResponse::new(json!({"score": 7})).with_confidence(0.4),
        ));
        let worker = AiStepWorker::new(backend, AiStepDefaults::default(), InsightService::default());
        let WorkerOutcome::Completed(output) = worker.execute(&dispatch(None)).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(output.confidence, Some(0.4));
    }

    #[tokio::test]
    async fn test_backend_failure_carries_code() {
        let backend = Arc::new(MockAiBackend::failing("model unavailable"));
        let worker = AiStepWorker::new(backend, AiStepDefaults::default(), InsightService::default());
        let err = worker.execute(&dispatch(None)).await.unwrap_err();
        assert!(err.code().starts_with("AI_"));
    }
}
