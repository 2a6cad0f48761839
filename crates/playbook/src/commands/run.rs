//! Run command - execute a bundle end to end.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde_json::{Value, json};
use tracing::info;

use playbook_engine::{ContractAwareOrchestrator, RunOptions, TransitionContext};
use playbook_types::{EntityKind, Priority, RunStatus, StepStatus};

use crate::bundle::Bundle;

use super::Context;

/// Arguments for the run command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the playbook bundle (TOML)
    pub bundle: PathBuf,

    /// Run inputs as inline JSON, or @path to read them from a file
    #[arg(short, long, default_value = "{}")]
    pub inputs: String,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Run priority: low, normal, high or critical
    #[arg(long, value_parser = parse_priority, default_value = "normal")]
    pub priority: Priority,

    /// Correlation id to stamp on the run
    #[arg(long)]
    pub correlation_id: Option<String>,
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    serde_json::from_value(json!(s)).map_err(|_| format!("unknown priority '{s}'"))
}

/// Inline JSON, or `@file` holding JSON.
fn read_inputs(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inputs from {path}"))?,
        None => raw.to_string(),
    };
    let inputs: Value = serde_json::from_str(&text).context("Inputs are not valid JSON")?;
    if !inputs.is_object() {
        bail!("Inputs must be a JSON object");
    }
    Ok(inputs)
}

/// Run the run command.
pub async fn run(args: RunArgs, ctx: &Context) -> Result<()> {
    let bundle = Bundle::load(&args.bundle)?;
    let inputs = read_inputs(&args.inputs)?;

    let orchestrator = ctx.orchestrator()?;
    let playbook_id = bundle.install(&orchestrator).await?;
    orchestrator
        .machine()
        .transition(
            EntityKind::Playbook,
            &playbook_id,
            "published",
            TransitionContext::new().by("cli"),
        )
        .await
        .context("Playbook could not be published")?;
    info!(playbook_id = %playbook_id, code = %bundle.playbook.code, "Playbook published");

    let cao = ContractAwareOrchestrator::new(orchestrator);
    let run = cao
        .start_run(
            &playbook_id,
            inputs,
            RunOptions {
                priority: args.priority,
                correlation_id: args.correlation_id.clone(),
                actor: "cli".to_string(),
            },
        )
        .await?;
    let run = cao
        .orchestrator()
        .run_until_settled(&run.id, Duration::from_secs(args.timeout_secs))
        .await?;
    let steps = cao.orchestrator().repo().run_steps(&run.id).await?;
    let score = cao.compliance_score(&run.id);

    if ctx.json_output {
        let report = json!({
            "run_id": run.id,
            "status": run.status,
            "outputs": run.outputs,
            "failure_reason": run.failure_reason,
            "validation_errors": run.validation_errors,
            "compliance_score": score,
            "ai_confidence": run.ai_confidence,
            "steps": steps
                .iter()
                .map(|s| json!({
                    "name": s.name,
                    "status": s.status,
                    "attempt": s.attempt,
                    "error": s.error,
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Run {} [{}]", run.id, run.status);
        for step in &steps {
            let marker = match step.status {
                StepStatus::Completed => "✓",
                StepStatus::Failed => "✗",
                StepStatus::Skipped => "-",
                _ => "…",
            };
            print!("  {marker} {:<24} {}", step.name, step.status);
            if let Some(ref error) = step.error {
                print!("  [{}] {}", error.code, error.message);
            }
            println!();
        }
        if let Some(score) = score {
            println!("Compliance score: {score}");
        }
        if let Some(ref reason) = run.failure_reason {
            println!("Failure: {reason}");
        }
        for error in &run.validation_errors {
            println!("  {error}");
        }
        if let Some(ref outputs) = run.outputs {
            println!("Outputs:\n{}", serde_json::to_string_pretty(outputs)?);
        }
    }

    match run.status {
        RunStatus::Completed => Ok(()),
        status if status.is_terminal() => bail!("Run ended {status}"),
        status => {
            let waiting = steps
                .iter()
                .filter(|s| s.status == StepStatus::WaitingInput)
                .count();
            bail!(
                "Run still {status} after {}s ({waiting} step(s) waiting for human input)",
                args.timeout_secs
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_must_be_object() {
        assert_eq!(read_inputs(r#"{"amount": 5}"#).unwrap(), json!({"amount": 5}));
        assert!(read_inputs("[1, 2]").is_err());
        assert!(read_inputs("not json").is_err());
    }

    #[test]
    fn test_inputs_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inputs.json");
        std::fs::write(&path, r#"{"applicant": "a-1"}"#).unwrap();
        let inputs = read_inputs(&format!("@{}", path.display())).unwrap();
        assert_eq!(inputs["applicant"], json!("a-1"));
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!(parse_priority("high").unwrap(), Priority::High);
        assert!(parse_priority("urgent").is_err());
    }
}
