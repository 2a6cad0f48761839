//! Playbook bundles: one TOML file holding a playbook definition, its
//! steps, contracts and policy documents.
//!
//! ```toml
//! [playbook]
//! code = "LOAN-APPROVAL"
//! name = "Loan approval"
//!
//! [contracts.input]
//! type = "object"
//! required = ["amount"]
//!
//! [policies.quorum.rules]
//! minimum_voters = 3
//!
//! [[steps]]
//! name = "credit_check"
//! sequence = 1
//! worker_type = "system"
//!
//! [steps.output_contract]
//! type = "object"
//! ```

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use serde_json::Value;

use playbook_contracts::{INPUT_CONTRACT, OUTPUT_CONTRACT, PolicyKind};
use playbook_engine::{Orchestrator, TransitionContext};
use playbook_types::{EntityKind, Id, StepDefinition};

#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub playbook: BundleHeader,
    #[serde(default)]
    pub contracts: BundleContracts,
    #[serde(default)]
    pub policies: HashMap<PolicyKind, Value>,
    #[serde(default)]
    pub steps: Vec<BundleStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleHeader {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleContracts {
    pub input: Option<Value>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleStep {
    #[serde(flatten)]
    pub definition: StepDefinition,
    #[serde(default)]
    pub input_contract: Option<Value>,
    #[serde(default)]
    pub output_contract: Option<Value>,
}

/// One problem found while checking a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub location: String,
    pub message: String,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

impl Bundle {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bundle {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid bundle {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Every contract in the bundle with where it came from.
    fn contracts(&self) -> Vec<(String, &Value)> {
        let mut out = Vec::new();
        if let Some(ref schema) = self.contracts.input {
            out.push(("contracts.input".to_string(), schema));
        }
        if let Some(ref schema) = self.contracts.output {
            out.push(("contracts.output".to_string(), schema));
        }
        for step in &self.steps {
            let name = &step.definition.name;
            if let Some(ref schema) = step.input_contract {
                out.push((format!("steps.{name}.input_contract"), schema));
            }
            if let Some(ref schema) = step.output_contract {
                out.push((format!("steps.{name}.output_contract"), schema));
            }
        }
        out
    }

    /// Write the playbook into the orchestrator's store as a draft.
    pub async fn install(&self, orchestrator: &Orchestrator) -> Result<Id> {
        let repo = orchestrator.repo();
        let header = &self.playbook;
        let playbook = repo
            .create_playbook(
                &orchestrator.config().organization_id,
                &header.code,
                &header.name,
                &header.description,
            )
            .await?;

        if let Some(ref schema) = self.contracts.input {
            repo.set_contract(&playbook.id, INPUT_CONTRACT, schema.clone())
                .await?;
        }
        if let Some(ref schema) = self.contracts.output {
            repo.set_contract(&playbook.id, OUTPUT_CONTRACT, schema.clone())
                .await?;
        }
        for (kind, document) in &self.policies {
            repo.set_policy(&playbook.id, *kind, document.clone()).await?;
        }
        for step in &self.steps {
            let stored = repo
                .add_step(&playbook.id, step.definition.clone())
                .await
                .with_context(|| format!("Failed to add step '{}'", step.definition.name))?;
            if let Some(ref schema) = step.input_contract {
                repo.set_contract(&stored.id, INPUT_CONTRACT, schema.clone())
                    .await?;
            }
            if let Some(ref schema) = step.output_contract {
                repo.set_contract(&stored.id, OUTPUT_CONTRACT, schema.clone())
                    .await?;
            }
        }
        Ok(playbook.id)
    }

    /// Schema compilation problems plus whatever would stop the draft from
    /// being published. Installs the bundle to ask the state machine.
    pub async fn check(&self, orchestrator: &Orchestrator) -> Result<Vec<Finding>> {
        let mut findings: Vec<Finding> = self
            .contracts()
            .into_iter()
            .filter_map(|(location, schema)| {
                orchestrator
                    .contracts()
                    .check_schema(schema)
                    .err()
                    .map(|e| Finding {
                        location,
                        message: e.to_string(),
                    })
            })
            .collect();

        let playbook_id = self.install(orchestrator).await?;
        let decision = orchestrator
            .machine()
            .can_transition(
                EntityKind::Playbook,
                &playbook_id,
                "published",
                &TransitionContext::new(),
            )
            .await?;
        if let Some(reason) = decision.reason.filter(|_| !decision.allowed) {
            findings.push(Finding {
                location: "playbook".to_string(),
                message: reason,
            });
        }
        Ok(findings)
    }
}
