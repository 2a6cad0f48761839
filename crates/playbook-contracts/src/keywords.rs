//! Custom schema keywords.
//!
//! Standard JSON Schema cannot express cross-field business rules or the
//! smart-code format, so contracts may carry two extension keywords:
//!
//! - `x-business-rule`: a rule name, or `{"rule": name, ...params}`, applied
//!   to the object at that level of the schema.
//! - `x-smart-code`: `true` for the default smart-code pattern, or a regex
//!   string the value must match.
//!
//! The validator ignores unknown keywords, so these are evaluated in a
//! separate pass over the normalized data.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde_json::Value;

use playbook_types::smart_code::SMART_CODE_PATTERN;

use crate::error::{ContractError, Result};
use crate::result::ValidationIssue;

pub const BUSINESS_RULE_KEYWORD: &str = "x-business-rule";
pub const SMART_CODE_KEYWORD: &str = "x-smart-code";

/// Tolerance for monetary comparisons.
const AMOUNT_TOLERANCE: f64 = 0.01;

/// A named cross-field rule. Receives the object being validated and the
/// keyword's parameters (an empty object when the keyword is a bare name).
pub type BusinessRuleFn = Arc<dyn Fn(&Value, &Value) -> std::result::Result<(), String> + Send + Sync>;

// ─────────────────────────────────────────────────────────────────────────────
// Rule registry
// ─────────────────────────────────────────────────────────────────────────────

/// Named business rules available to `x-business-rule`.
#[derive(Clone)]
pub struct BusinessRuleRegistry {
    rules: HashMap<String, BusinessRuleFn>,
}

impl std::fmt::Debug for BusinessRuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.rules.keys().collect();
        names.sort();
        f.debug_struct("BusinessRuleRegistry")
            .field("rules", &names)
            .finish()
    }
}

impl Default for BusinessRuleRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("budget_breakdown_matches_total", budget_breakdown_matches_total);
        registry.register("end_after_start", end_after_start);
        registry
    }
}

impl BusinessRuleRegistry {
    /// A registry without the built-in rules.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, rule: F)
    where
        F: Fn(&Value, &Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.rules.insert(name.into(), Arc::new(rule));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&BusinessRuleFn> {
        self.rules.get(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compiled keywords
// ─────────────────────────────────────────────────────────────────────────────

/// Custom keywords found in one schema, resolved ahead of time.
#[derive(Debug, Clone, Default)]
pub struct KeywordSet {
    node: NodeKeywords,
    properties: Vec<(String, KeywordSet)>,
    items: Option<Box<KeywordSet>>,
}

#[derive(Debug, Clone, Default)]
struct NodeKeywords {
    rules: Vec<(String, Value)>,
    smart_code: Option<Regex>,
}

impl KeywordSet {
    /// Walk `schema`, resolving rule names and compiling smart-code patterns.
    pub fn compile(schema: &Value, registry: &BusinessRuleRegistry) -> Result<Self> {
        let Value::Object(map) = schema else {
            return Ok(Self::default());
        };

        let mut set = Self::default();
        if let Some(rule) = map.get(BUSINESS_RULE_KEYWORD) {
            for (name, params) in rule_specs(rule)? {
                if !registry.contains(&name) {
                    return Err(ContractError::Schema(format!(
                        "unknown business rule '{name}'"
                    )));
                }
                set.node.rules.push((name, params));
            }
        }
        if let Some(code) = map.get(SMART_CODE_KEYWORD) {
            let pattern = match code {
                Value::Bool(true) => Some(SMART_CODE_PATTERN),
                Value::Bool(false) => None,
                Value::String(p) => Some(p.as_str()),
                other => {
                    return Err(ContractError::Schema(format!(
                        "{SMART_CODE_KEYWORD} must be a boolean or pattern, got {other}"
                    )));
                }
            };
            if let Some(pattern) = pattern {
                let regex = Regex::new(pattern).map_err(|e| {
                    ContractError::Schema(format!("invalid {SMART_CODE_KEYWORD} pattern: {e}"))
                })?;
                set.node.smart_code = Some(regex);
            }
        }
        if let Some(properties) = map.get("properties").and_then(Value::as_object) {
            for (name, prop_schema) in properties {
                let child = Self::compile(prop_schema, registry)?;
                if !child.is_empty() {
                    set.properties.push((name.clone(), child));
                }
            }
        }
        if let Some(items) = map.get("items") {
            let child = Self::compile(items, registry)?;
            if !child.is_empty() {
                set.items = Some(Box::new(child));
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.node.rules.is_empty()
            && self.node.smart_code.is_none()
            && self.properties.is_empty()
            && self.items.is_none()
    }

    /// Evaluate every keyword against `data`, collecting issues.
    pub fn evaluate(&self, data: &Value, registry: &BusinessRuleRegistry) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.evaluate_at(data, "", registry, &mut issues);
        issues
    }

    fn evaluate_at(
        &self,
        data: &Value,
        path: &str,
        registry: &BusinessRuleRegistry,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for (name, params) in &self.node.rules {
            if let Some(rule) = registry.get(name)
                && let Err(message) = rule(data, params)
            {
                issues.push(ValidationIssue::business_rule(path, name, message));
            }
        }
        if let Some(regex) = &self.node.smart_code
            && let Some(code) = data.as_str()
            && !regex.is_match(code)
        {
            issues.push(ValidationIssue::smart_code(path, code));
        }
        for (name, child) in &self.properties {
            if let Some(value) = data.get(name) {
                child.evaluate_at(value, &format!("{path}/{name}"), registry, issues);
            }
        }
        if let (Some(child), Some(items)) = (&self.items, data.as_array()) {
            for (i, item) in items.iter().enumerate() {
                child.evaluate_at(item, &format!("{path}/{i}"), registry, issues);
            }
        }
    }
}

/// `x-business-rule` accepts a name, an object, or a list of either.
fn rule_specs(keyword: &Value) -> Result<Vec<(String, Value)>> {
    match keyword {
        Value::String(name) => Ok(vec![(name.clone(), Value::Object(Default::default()))]),
        Value::Object(map) => match map.get("rule").and_then(Value::as_str) {
            Some(name) => Ok(vec![(name.to_string(), keyword.clone())]),
            None => Err(ContractError::Schema(format!(
                "{BUSINESS_RULE_KEYWORD} object needs a 'rule' name"
            ))),
        },
        Value::Array(specs) => {
            let mut out = Vec::new();
            for spec in specs {
                out.extend(rule_specs(spec)?);
            }
            Ok(out)
        }
        other => Err(ContractError::Schema(format!(
            "{BUSINESS_RULE_KEYWORD} must be a name or object, got {other}"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ─────────────────────────────────────────────────────────────────────────────

fn param<'a>(params: &'a Value, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

/// The breakdown amounts must sum to the total.
///
/// Params: `total_field` (default `total_amount`), `breakdown_field` (default
/// `budget_breakdown`), `amount_field` (default `amount`). The breakdown may
/// be a list of objects carrying `amount_field` or a map of name to amount.
fn budget_breakdown_matches_total(data: &Value, params: &Value) -> std::result::Result<(), String> {
    let total_field = param(params, "total_field", "total_amount");
    let breakdown_field = param(params, "breakdown_field", "budget_breakdown");
    let amount_field = param(params, "amount_field", "amount");

    let (Some(total), Some(breakdown)) = (
        data.get(total_field).and_then(Value::as_f64),
        data.get(breakdown_field),
    ) else {
        return Ok(());
    };

    let sum: f64 = match breakdown {
        Value::Array(lines) => lines
            .iter()
            .filter_map(|line| line.get(amount_field).and_then(Value::as_f64))
            .sum(),
        Value::Object(parts) => parts.values().filter_map(Value::as_f64).sum(),
        _ => return Err(format!("'{breakdown_field}' must be a list or map")),
    };

    if (sum - total).abs() > AMOUNT_TOLERANCE {
        return Err(format!(
            "'{breakdown_field}' sums to {sum:.2} but '{total_field}' is {total:.2}"
        ));
    }
    Ok(())
}

/// The end date must fall after the start date.
///
/// Params: `start_field` (default `start_date`), `end_field` (default
/// `end_date`). Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates.
fn end_after_start(data: &Value, params: &Value) -> std::result::Result<(), String> {
    let start_field = param(params, "start_field", "start_date");
    let end_field = param(params, "end_field", "end_date");

    let (Some(start), Some(end)) = (
        data.get(start_field).and_then(Value::as_str),
        data.get(end_field).and_then(Value::as_str),
    ) else {
        return Ok(());
    };
    let (Some(start_ts), Some(end_ts)) = (parse_instant(start), parse_instant(end)) else {
        return Err(format!("'{start_field}' and '{end_field}' must be dates"));
    };
    if end_ts <= start_ts {
        return Err(format!("'{end_field}' ({end}) must be after '{start_field}' ({start})"));
    }
    Ok(())
}

fn parse_instant(s: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.timestamp());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(schema: Value) -> KeywordSet {
        KeywordSet::compile(&schema, &BusinessRuleRegistry::default()).unwrap()
    }

    #[test]
    fn test_budget_rule() {
        let registry = BusinessRuleRegistry::default();
        let set = compile(json!({
            "type": "object",
            "x-business-rule": "budget_breakdown_matches_total"
        }));

        let ok = json!({"total_amount": 100, "budget_breakdown": [{"amount": 60}, {"amount": 40}]});
        assert!(set.evaluate(&ok, &registry).is_empty());

        let bad = json!({"total_amount": 100, "budget_breakdown": {"travel": 30, "kit": 30}});
        let issues = set.evaluate(&bad, &registry);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains("sums to 60.00"));
    }

    #[test]
    fn test_end_after_start_with_custom_fields() {
        let registry = BusinessRuleRegistry::default();
        let set = compile(json!({
            "type": "object",
            "properties": {
                "period": {
                    "type": "object",
                    "x-business-rule": {"rule": "end_after_start", "start_field": "from", "end_field": "to"}
                }
            }
        }));

        let ok = json!({"period": {"from": "2026-01-01", "to": "2026-02-01T00:00:00Z"}});
        assert!(set.evaluate(&ok, &registry).is_empty());

        let bad = json!({"period": {"from": "2026-03-01", "to": "2026-02-01"}});
        let issues = set.evaluate(&bad, &registry);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/period");
    }

    #[test]
    fn test_smart_code_keyword() {
        let registry = BusinessRuleRegistry::default();
        let set = compile(json!({
            "type": "object",
            "properties": {"code": {"type": "string", "x-smart-code": true}}
        }));
        assert!(
            set.evaluate(&json!({"code": "GRANT.REVIEW.SCORE.v2"}), &registry)
                .is_empty()
        );
        assert_eq!(
            set.evaluate(&json!({"code": "grant-review"}), &registry).len(),
            1
        );
    }

    #[test]
    fn test_unknown_rule_is_schema_error() {
        let err = KeywordSet::compile(
            &json!({"x-business-rule": "no_such_rule"}),
            &BusinessRuleRegistry::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::Schema(_)));
    }

    #[test]
    fn test_custom_rule_registration() {
        let mut registry = BusinessRuleRegistry::empty();
        registry.register("positive", |data, _| match data.as_f64() {
            Some(n) if n > 0.0 => Ok(()),
            _ => Err("must be positive".into()),
        });
        let set = KeywordSet::compile(
            &json!({"items": {"x-business-rule": "positive"}}),
            &registry,
        )
        .unwrap();
        let issues = set.evaluate(&json!([1, -2, 3]), &registry);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "/1");
    }
}
