//! Contract Validation Service.
//!
//! Contracts are JSON Schemas stored as dynamic fields (`input_contract`,
//! `output_contract`) on playbook and step entities. Each validation call:
//!
//! ```text
//! fetch document ──► compile (cached by entity:field) ──► normalize
//!                                                           │
//!        ValidationResult ◄── custom keywords ◄── jsonschema ┘
//! ```
//!
//! Nothing here returns an error to the caller: lookup and compile problems
//! become `valid = false` results carrying a machine-readable code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use playbook_store::SharedStore;

use crate::error::{ContractError, Result};
use crate::keywords::{BusinessRuleRegistry, KeywordSet};
use crate::normalize::{NormalizeOptions, normalize};
use crate::policy::{
    self, ApprovalContext, PolicyKind, PolicyResult, QuorumContext, RetryContext,
    SegregationContext, Severity, SlaContext,
};
use crate::result::{ValidationIssue, ValidationPerformance, ValidationResult};

/// Dynamic field holding an input contract.
pub const INPUT_CONTRACT: &str = "input_contract";
/// Dynamic field holding an output contract.
pub const OUTPUT_CONTRACT: &str = "output_contract";

const DEFAULT_BUSINESS_HOURS_PER_DAY: f64 = 8.0;

/// A contract ready to validate against.
pub struct CompiledContract {
    source: Value,
    validator: jsonschema::Validator,
    keywords: KeywordSet,
}

impl CompiledContract {
    pub fn schema(&self) -> &Value {
        &self.source
    }
}

impl std::fmt::Debug for CompiledContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledContract")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub struct ContractValidationService {
    store: SharedStore,
    cache: RwLock<HashMap<String, Arc<CompiledContract>>>,
    options: NormalizeOptions,
    rules: BusinessRuleRegistry,
    business_hours_per_day: f64,
}

impl ContractValidationService {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            options: NormalizeOptions::default(),
            rules: BusinessRuleRegistry::default(),
            business_hours_per_day: DEFAULT_BUSINESS_HOURS_PER_DAY,
        }
    }

    pub fn with_options(mut self, options: NormalizeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_business_rules(mut self, rules: BusinessRuleRegistry) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_business_hours_per_day(mut self, hours: f64) -> Self {
        self.business_hours_per_day = hours;
        self
    }

    pub fn options(&self) -> &NormalizeOptions {
        &self.options
    }

    // ─────────────────────────────────────────────────────────────────────
    // Contracts
    // ─────────────────────────────────────────────────────────────────────

    /// Validate data against a playbook's input contract. A missing contract
    /// is an error.
    pub async fn validate_playbook_input(&self, playbook_id: &str, data: &Value) -> ValidationResult {
        self.validate_contract(playbook_id, INPUT_CONTRACT, data, true)
            .await
    }

    /// Validate data against a playbook's output contract. A missing contract
    /// is an error.
    pub async fn validate_playbook_output(&self, playbook_id: &str, data: &Value) -> ValidationResult {
        self.validate_contract(playbook_id, OUTPUT_CONTRACT, data, true)
            .await
    }

    /// Validate data against a step's input contract; passes when the step
    /// has none.
    pub async fn validate_step_input(&self, step_id: &str, data: &Value) -> ValidationResult {
        self.validate_contract(step_id, INPUT_CONTRACT, data, false)
            .await
    }

    /// Validate data against a step's output contract; passes when the step
    /// has none.
    pub async fn validate_step_output(&self, step_id: &str, data: &Value) -> ValidationResult {
        self.validate_contract(step_id, OUTPUT_CONTRACT, data, false)
            .await
    }

    /// Validate `data` against the contract in `entity_id`'s `field`.
    pub async fn validate_contract(
        &self,
        entity_id: &str,
        field: &str,
        data: &Value,
        required: bool,
    ) -> ValidationResult {
        let load_start = Instant::now();
        let contract = match self.load(entity_id, field).await {
            Ok(Some(contract)) => contract,
            Ok(None) if required => {
                let err = ContractError::NotFound {
                    entity_id: entity_id.to_string(),
                    field: field.to_string(),
                };
                debug!(entity_id, field, "Required contract missing");
                return ValidationResult::from_error(&err);
            }
            Ok(None) => {
                return ValidationResult::passed(
                    data.clone(),
                    ValidationPerformance {
                        validation_time_ms: 0.0,
                        schema_load_time_ms: elapsed_ms(load_start),
                    },
                );
            }
            Err(err) => {
                warn!(entity_id, field, error = %err, "Failed to load contract");
                return ValidationResult::from_error(&err);
            }
        };
        let schema_load_time_ms = elapsed_ms(load_start);

        let mut result = self.validate_compiled(&contract, data);
        result.performance.schema_load_time_ms = schema_load_time_ms;
        if !result.valid {
            debug!(
                entity_id,
                field,
                errors = result.errors.len(),
                "Contract validation failed"
            );
        }
        result
    }

    /// Validate against an inline schema without caching.
    pub fn validate_against(&self, schema: &Value, data: &Value) -> ValidationResult {
        let load_start = Instant::now();
        match self.compile(schema) {
            Ok(contract) => {
                let mut result = self.validate_compiled(&contract, data);
                result.performance.schema_load_time_ms = elapsed_ms(load_start);
                result
            }
            Err(err) => ValidationResult::from_error(&err),
        }
    }

    /// Check that a schema compiles, including its custom keywords.
    pub fn check_schema(&self, schema: &Value) -> Result<()> {
        self.compile(schema).map(|_| ())
    }

    /// Drop cached contracts for an entity.
    pub fn invalidate(&self, entity_id: &str) {
        let prefix = format!("{entity_id}:");
        self.cache.write().retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn cached_contracts(&self) -> usize {
        self.cache.read().len()
    }

    /// Fetch and compile a contract, reusing the cached compilation while
    /// the stored document is unchanged.
    async fn load(&self, entity_id: &str, field: &str) -> Result<Option<Arc<CompiledContract>>> {
        let Some(stored) = self.store.get_dynamic_field(entity_id, field).await? else {
            return Ok(None);
        };
        let document = parse_document(stored)?;

        let key = format!("{entity_id}:{field}");
        if let Some(cached) = self.cache.read().get(&key)
            && cached.source == document
        {
            return Ok(Some(Arc::clone(cached)));
        }

        let compiled = Arc::new(self.compile(&document)?);
        self.cache.write().insert(key, Arc::clone(&compiled));
        debug!(entity_id, field, "Compiled contract");
        Ok(Some(compiled))
    }

    fn compile(&self, schema: &Value) -> Result<CompiledContract> {
        if !schema.is_object() {
            return Err(ContractError::Schema("contract must be a JSON object".into()));
        }
        let validator = jsonschema::options()
            .should_validate_formats(true)
            .build(schema)
            .map_err(|e| ContractError::Schema(e.to_string()))?;
        let keywords = KeywordSet::compile(schema, &self.rules)?;
        Ok(CompiledContract {
            source: schema.clone(),
            validator,
            keywords,
        })
    }

    fn validate_compiled(&self, contract: &CompiledContract, data: &Value) -> ValidationResult {
        let start = Instant::now();
        let normalized = normalize(&contract.source, data, &self.options);

        let mut errors: Vec<ValidationIssue> = contract
            .validator
            .iter_errors(&normalized)
            .map(|e| ValidationIssue::schema(e.to_string()))
            .collect();
        if errors.is_empty() {
            errors = contract.keywords.evaluate(&normalized, &self.rules);
        }

        let performance = ValidationPerformance {
            validation_time_ms: elapsed_ms(start),
            schema_load_time_ms: 0.0,
        };
        if errors.is_empty() {
            ValidationResult::passed(normalized, performance)
        } else {
            ValidationResult::failed(errors, performance)
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Policies
    // ─────────────────────────────────────────────────────────────────────

    pub async fn validate_sla_policy(&self, playbook_id: &str, ctx: &SlaContext) -> PolicyResult {
        match self.load_policy(playbook_id, PolicyKind::Sla).await {
            Ok(doc) => policy::sla::evaluate(doc.as_ref(), ctx, self.business_hours_per_day),
            Err(result) => result,
        }
    }

    pub async fn validate_quorum_policy(&self, playbook_id: &str, ctx: &QuorumContext) -> PolicyResult {
        match self.load_policy(playbook_id, PolicyKind::Quorum).await {
            Ok(doc) => policy::quorum::evaluate(doc.as_ref(), ctx),
            Err(result) => result,
        }
    }

    pub async fn validate_segregation_policy(
        &self,
        playbook_id: &str,
        ctx: &SegregationContext,
    ) -> PolicyResult {
        match self.load_policy(playbook_id, PolicyKind::Segregation).await {
            Ok(doc) => policy::segregation::evaluate(doc.as_ref(), ctx),
            Err(result) => result,
        }
    }

    pub async fn validate_approval_policy(
        &self,
        playbook_id: &str,
        ctx: &ApprovalContext,
    ) -> PolicyResult {
        match self.load_policy(playbook_id, PolicyKind::Approval).await {
            Ok(doc) => policy::approval::evaluate(doc.as_ref(), ctx),
            Err(result) => result,
        }
    }

    pub async fn validate_retry_policy(&self, playbook_id: &str, ctx: &RetryContext) -> PolicyResult {
        match self.load_policy(playbook_id, PolicyKind::Retry).await {
            Ok(doc) => policy::retry::evaluate(doc.as_ref(), ctx),
            Err(result) => result,
        }
    }

    async fn load_policy(
        &self,
        playbook_id: &str,
        kind: PolicyKind,
    ) -> std::result::Result<Option<Value>, PolicyResult> {
        let stored = self
            .store
            .get_dynamic_field(playbook_id, kind.field_name())
            .await
            .map_err(|e| {
                warn!(playbook_id, policy = %kind, error = %e, "Failed to load policy");
                PolicyResult::fail(kind, Severity::Error, format!("{kind} policy lookup failed: {e}"))
            })?;
        match stored {
            None => Ok(None),
            Some(stored) => parse_document(stored).map(Some).map_err(|e| {
                PolicyResult::fail(kind, Severity::Error, format!("malformed {kind} policy: {e}"))
            }),
        }
    }
}

/// Documents may be stored as JSON values or as raw JSON text.
fn parse_document(stored: Value) -> Result<Value> {
    match stored {
        Value::String(text) => {
            serde_json::from_str(&text).map_err(|e| ContractError::Schema(e.to_string()))
        }
        other => Ok(other),
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
