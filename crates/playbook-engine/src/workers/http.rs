//! System and external steps: one POST to a service endpoint per attempt.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Serialize;
use serde_json::Value;

use super::{StepWorker, WorkerOutcome, WorkerOutput, is_empty_output};
use crate::dispatch::StepDispatch;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct HttpWorkerConfig {
    /// Used when a step definition names no endpoint of its own.
    pub default_endpoint: Option<String>,
    pub api_token: Option<String>,
    /// Timeout for steps without an SLA.
    pub default_timeout: Duration,
}

impl Default for HttpWorkerConfig {
    fn default() -> Self {
        Self {
            default_endpoint: None,
            api_token: None,
            default_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Serialize)]
struct ServiceRequest<'a> {
    step_id: &'a str,
    run_id: &'a str,
    step_name: &'a str,
    attempt: u32,
    inputs: &'a Value,
    context: ServiceContext<'a>,
}

#[derive(Debug, Serialize)]
struct ServiceContext<'a> {
    organization_id: &'a str,
    correlation_id: &'a str,
    playbook_id: &'a str,
}

pub struct HttpServiceWorker {
    client: Client,
    config: HttpWorkerConfig,
}

impl HttpServiceWorker {
    pub fn new(config: HttpWorkerConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::worker("HTTP_CLIENT", format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint<'a>(&'a self, dispatch: &'a StepDispatch) -> Result<&'a str> {
        dispatch
            .definition
            .service_endpoint
            .as_deref()
            .or(self.config.default_endpoint.as_deref())
            .ok_or_else(|| {
                EngineError::worker(
                    "NO_ENDPOINT",
                    format!("step '{}' has no service endpoint", dispatch.step.name),
                )
            })
    }

    fn timeout(&self, dispatch: &StepDispatch) -> Duration {
        match dispatch.definition.sla_seconds {
            0 => self.config.default_timeout,
            secs => Duration::from_secs(secs),
        }
    }
}

#[async_trait]
impl StepWorker for HttpServiceWorker {
    async fn execute(&self, dispatch: &StepDispatch) -> Result<WorkerOutcome> {
        let endpoint = self.endpoint(dispatch)?;
        let body = ServiceRequest {
            step_id: &dispatch.step.id,
            run_id: &dispatch.run.id,
            step_name: &dispatch.step.name,
            attempt: dispatch.step.attempt,
            inputs: &dispatch.inputs,
            context: ServiceContext {
                organization_id: &dispatch.run.organization_id,
                correlation_id: &dispatch.run.correlation_id,
                playbook_id: &dispatch.run.playbook_id,
            },
        };

        tracing::debug!(
            step_id = %dispatch.step.id,
            endpoint,
            attempt = dispatch.step.attempt,
            "Calling step service"
        );
        let mut request = self
            .client
            .post(endpoint)
            .timeout(self.timeout(dispatch))
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Idempotency-Key", dispatch.idempotency_key())
            .json(&body);
        if let Some(ref token) = self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::worker(
                format!("HTTP_{}", status.as_u16()),
                format!("service returned {status}: {}", truncate(&text, 200)),
            ));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| EngineError::worker("INVALID_RESPONSE", e.to_string()))?;
        parse_reply(reply)
    }
}

/// Outputs are the `outputs` field when present, else the whole body.
fn parse_reply(reply: Value) -> Result<WorkerOutcome> {
    let side_effects = reply
        .get("side_effects")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let cost = reply.get("cost").and_then(Value::as_f64).unwrap_or(0.0);
    let confidence = reply.get("confidence").and_then(Value::as_f64);
    let outputs = match reply.get("outputs") {
        Some(outputs) => outputs.clone(),
        None => reply,
    };
    if is_empty_output(&outputs) {
        return Err(EngineError::worker(
            "EMPTY_OUTPUTS",
            "service returned no outputs",
        ));
    }
    Ok(WorkerOutcome::Completed(WorkerOutput {
        outputs,
        confidence,
        insights: None,
        side_effects,
        cost,
    }))
}

fn transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::worker("TIMEOUT", err.to_string())
    } else {
        EngineError::worker("NETWORK_ERROR", err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ExecutionContext;
    use playbook_types::{
        PlaybookRun, StepDefinition, StepExecution, StepStatus, WorkerType,
    };
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatch(endpoint: Option<String>) -> StepDispatch {
        let mut definition = StepDefinition::new("enrich", 1, WorkerType::System);
        definition.id = "def-1".into();
        definition.service_endpoint = endpoint;
        definition.sla_seconds = 5;
        let run: PlaybookRun = serde_json::from_value(json!({
            "id": "run-1",
            "organization_id": "org-1",
            "playbook_id": "pb-1",
            "correlation_id": "corr-1"
        }))
        .unwrap();
        let mut step = StepExecution::from_definition(&definition, &run, StepStatus::Running);
        step.id = "exec-1".into();
        step.attempt = 2;
        StepDispatch {
            run,
            step,
            definition,
            inputs: json!({"customer_id": "c-9"}),
            context: ExecutionContext::default(),
            completed: Vec::new(),
        }
    }

    fn worker() -> HttpServiceWorker {
        HttpServiceWorker::new(HttpWorkerConfig {
            api_token: Some("secret".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_inputs_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/enrich"))
            .and(header("X-Idempotency-Key", "exec-1-2"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "outputs": {"score": 42},
                "side_effects": ["crm_updated"],
                "cost": 0.25
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = worker()
            .execute(&dispatch(Some(format!("{}/enrich", server.uri()))))
            .await
            .unwrap();
        let WorkerOutcome::Completed(output) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output.outputs, json!({"score": 42}));
        assert_eq!(output.side_effects, vec!["crm_updated".to_string()]);
        assert_eq!(output.cost, 0.25);
    }

    #[tokio::test]
    async fn test_non_success_status_maps_to_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let err = worker()
            .execute(&dispatch(Some(server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HTTP_503");
    }

    #[tokio::test]
    async fn test_empty_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let err = worker()
            .execute(&dispatch(Some(server.uri())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EMPTY_OUTPUTS");
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let err = worker().execute(&dispatch(None)).await.unwrap_err();
        assert_eq!(err.code(), "NO_ENDPOINT");
    }
}
