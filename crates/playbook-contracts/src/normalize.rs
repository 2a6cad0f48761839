//! Data normalization ahead of schema validation.
//!
//! Contract data arrives from forms, HTTP workers and models, so it is rarely
//! typed exactly as declared. Before the validator sees it, values are walked
//! alongside the schema:
//!
//! ```text
//! input ──► defaults ──► coercion ──► strip unknown keys ──► validator
//! ```
//!
//! Each stage can be switched off through [`NormalizeOptions`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Switches for the normalization stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Convert scalars to the declared type where the conversion is lossless.
    pub coerce_types: bool,
    /// Drop properties the schema does not declare.
    pub remove_additional: bool,
    /// Fill absent properties from their `default`.
    pub use_defaults: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            coerce_types: true,
            remove_additional: true,
            use_defaults: true,
        }
    }
}

impl NormalizeOptions {
    /// All stages off: the validator sees the data untouched.
    pub fn strict() -> Self {
        Self {
            coerce_types: false,
            remove_additional: false,
            use_defaults: false,
        }
    }
}

/// Normalize `value` against `schema`, returning the adjusted copy.
pub fn normalize(schema: &Value, value: &Value, options: &NormalizeOptions) -> Value {
    let Value::Object(schema) = schema else {
        return value.clone();
    };

    let value = if options.coerce_types {
        coerce(schema, value)
    } else {
        value.clone()
    };

    match value {
        Value::Object(map) if declares_object(schema) => {
            Value::Object(normalize_object(schema, map, options))
        }
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) => Value::Array(
                items
                    .iter()
                    .map(|item| normalize(item_schema, item, options))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        other => other,
    }
}

fn normalize_object(
    schema: &Map<String, Value>,
    mut map: Map<String, Value>,
    options: &NormalizeOptions,
) -> Map<String, Value> {
    let properties = schema.get("properties").and_then(Value::as_object);

    if options.use_defaults
        && let Some(properties) = properties
    {
        for (name, prop_schema) in properties {
            if !map.contains_key(name)
                && let Some(default) = prop_schema.get("default")
            {
                map.insert(name.clone(), default.clone());
            }
        }
    }

    let additional = schema.get("additionalProperties");
    let mut out = Map::with_capacity(map.len());
    for (name, value) in map {
        match properties.and_then(|p| p.get(&name)) {
            Some(prop_schema) => {
                out.insert(name, normalize(prop_schema, &value, options));
            }
            None => match additional {
                Some(extra_schema @ Value::Object(_)) => {
                    out.insert(name, normalize(extra_schema, &value, options));
                }
                Some(Value::Bool(true)) => {
                    out.insert(name, value);
                }
                // Undeclared and not explicitly allowed.
                _ if options.remove_additional && properties.is_some() => {}
                _ => {
                    out.insert(name, value);
                }
            },
        }
    }
    out
}

fn declares_object(schema: &Map<String, Value>) -> bool {
    declared_types(schema).contains(&"object") || schema.contains_key("properties")
}

fn declared_types(schema: &Map<String, Value>) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coercion
// ─────────────────────────────────────────────────────────────────────────────

/// Coerce a scalar to the first declared type it converts to.
///
/// Values already of a declared type, and values that convert to none of
/// them, are returned unchanged; the validator reports the latter.
fn coerce(schema: &Map<String, Value>, value: &Value) -> Value {
    let types = declared_types(schema);
    if types.is_empty() || types.iter().any(|t| is_type(value, t)) {
        return value.clone();
    }
    types
        .iter()
        .find_map(|t| coerce_to(value, t))
        .unwrap_or_else(|| value.clone())
}

fn is_type(value: &Value, ty: &str) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64() || is_integral_float(value),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn is_integral_float(value: &Value) -> bool {
    value.as_f64().is_some_and(|f| f.fract() == 0.0)
}

fn coerce_to(value: &Value, ty: &str) -> Option<Value> {
    match (ty, value) {
        ("number", Value::String(s)) => parse_number(s.trim()),
        ("integer", Value::String(s)) => parse_integer(s.trim()),
        ("integer", Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Value::from(f as i64)),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        ("boolean", Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(Value::Bool(true)),
            Some(0) => Some(Value::Bool(false)),
            _ => None,
        },
        ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
        ("array", v) if !v.is_null() => Some(Value::Array(vec![v.clone()])),
        _ => None,
    }
}

/// Parse a numeric string, preferring an integer representation so that
/// `"100"` compares equal to `100`.
fn parse_number(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(u) = s.parse::<u64>() {
        return Some(Value::from(u));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn parse_integer(s: &str) -> Option<Value> {
    match parse_number(s)? {
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(Value::Number(n)),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0)
            .map(|f| Value::from(f as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approval_schema() -> Value {
        json!({
            "type": "object",
            "required": ["amount", "approver"],
            "properties": {
                "amount": {"type": "number"},
                "approver": {"type": "string"},
                "urgent": {"type": "boolean", "default": false},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        })
    }

    #[test]
    fn test_coerces_and_strips() {
        let out = normalize(
            &approval_schema(),
            &json!({"amount": "100", "approver": "u1", "extra": 1}),
            &NormalizeOptions::default(),
        );
        assert_eq!(out, json!({"amount": 100, "approver": "u1", "urgent": false}));
    }

    #[test]
    fn test_strict_leaves_data_alone() {
        let input = json!({"amount": "100", "approver": "u1", "extra": 1});
        let out = normalize(&approval_schema(), &input, &NormalizeOptions::strict());
        assert_eq!(out, input);
    }

    #[test]
    fn test_additional_properties_true_keeps_extras() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": true
        });
        let out = normalize(&schema, &json!({"a": "x", "b": 2}), &NormalizeOptions::default());
        assert_eq!(out, json!({"a": "x", "b": 2}));
    }

    #[test]
    fn test_scalar_wrapped_into_array_and_items_coerced() {
        let out = normalize(
            &approval_schema(),
            &json!({"amount": 5, "approver": "u1", "tags": 7}),
            &NormalizeOptions::default(),
        );
        assert_eq!(out["tags"], json!(["7"]));
    }

    #[test]
    fn test_nested_objects_and_booleans() {
        let schema = json!({
            "type": "object",
            "properties": {
                "review": {
                    "type": "object",
                    "properties": {"passed": {"type": "boolean"}, "score": {"type": "integer"}}
                }
            }
        });
        let out = normalize(
            &schema,
            &json!({"review": {"passed": "yes", "score": "4.0", "noise": true}}),
            &NormalizeOptions::default(),
        );
        assert_eq!(out, json!({"review": {"passed": true, "score": 4}}));
    }

    #[test]
    fn test_unconvertible_value_left_for_validator() {
        let out = normalize(
            &approval_schema(),
            &json!({"amount": "lots", "approver": "u1"}),
            &NormalizeOptions::default(),
        );
        assert_eq!(out["amount"], json!("lots"));
    }
}
