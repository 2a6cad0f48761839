//! Validate command - check a bundle without running it.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use serde_json::json;

use crate::bundle::Bundle;

use super::Context;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the playbook bundle (TOML)
    pub bundle: PathBuf,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let bundle = Bundle::load(&args.bundle)?;

    // Checked against a throwaway in-memory store with the mock AI backend.
    let mut config = ctx.config.clone();
    config.storage = None;
    config.ai = None;
    let orchestrator = playbook_engine::OrchestratorBuilder::from_config(&config)?.build()?;
    let findings = bundle.check(&orchestrator).await?;

    if ctx.json_output {
        let report = json!({
            "bundle": args.bundle.display().to_string(),
            "code": bundle.playbook.code,
            "steps": bundle.steps.len(),
            "valid": findings.is_empty(),
            "findings": findings
                .iter()
                .map(|f| json!({"location": f.location, "message": f.message}))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if findings.is_empty() {
        println!(
            "{} ({}): {} step(s), ready to publish",
            bundle.playbook.name,
            bundle.playbook.code,
            bundle.steps.len()
        );
    } else {
        println!("{} ({}):", bundle.playbook.name, bundle.playbook.code);
        for finding in &findings {
            println!("  ✗ {finding}");
        }
    }

    if !findings.is_empty() {
        bail!("{} problem(s) found in {}", findings.len(), args.bundle.display());
    }
    Ok(())
}
