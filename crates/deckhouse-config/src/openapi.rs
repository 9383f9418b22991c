//! Validation of module settings against the module's OpenAPI values schema.
//!
//! Covers the subset of OpenAPI v3 used by `openapi/config-values.yaml`:
//! `type`, `properties`, `required`, `additionalProperties`, `items`, `enum`,
//! `minimum`/`maximum`, `minLength`/`maxLength`, `minItems`/`maxItems`,
//! `pattern`, `allOf`/`anyOf`/`oneOf` and `nullable`. Objects declaring
//! `properties` reject unknown keys unless `additionalProperties` says
//! otherwise. `x-*` extensions and `default` are ignored.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
};

use regex::Regex;
use serde_json::{Map, Value};

use crate::{aggregated::value_kind, constants::GLOBAL_MODULE_NAME};

/// Validates settings wrapped as `{valuesKey: settings}`.
pub trait ValuesValidator: Debug + Send + Sync {
    fn validate_global_values(&self, values: &Value) -> Result<(), ValuesError>;

    fn validate_module_values(&self, values_key: &str, values: &Value) -> Result<(), ValuesError>;
}

/// All violations found in one values document, one per line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuesError {
    pub values_key: String,
    pub violations: Vec<String>,
}

impl Display for ValuesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' values are not valid:", self.values_key)?;
        for violation in &self.violations {
            write!(f, "\n{violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValuesError {}

/// Holds the values schemas of `global` and of every module, keyed by
/// values key. Modules without a schema accept any settings.
#[derive(Clone, Debug, Default)]
pub struct SchemaValidator {
    global: Option<Value>,
    modules: BTreeMap<String, Value>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global_schema(&mut self, schema: Value) {
        self.global = Some(schema);
    }

    pub fn add_module_schema(&mut self, values_key: impl Into<String>, schema: Value) {
        self.modules.insert(values_key.into(), schema);
    }

    pub fn has_module_schema(&self, values_key: &str) -> bool {
        self.modules.contains_key(values_key)
    }

    fn validate(
        schema: Option<&Value>,
        values_key: &str,
        values: &Value,
    ) -> Result<(), ValuesError> {
        let Some(schema) = schema else {
            return Ok(());
        };

        let empty = Value::Object(Map::new());
        let settings = values.get(values_key).unwrap_or(&empty);

        let mut violations = Vec::new();
        validate_node(schema, settings, values_key, &mut violations);

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValuesError {
                values_key: values_key.to_owned(),
                violations,
            })
        }
    }
}

impl ValuesValidator for SchemaValidator {
    fn validate_global_values(&self, values: &Value) -> Result<(), ValuesError> {
        Self::validate(self.global.as_ref(), GLOBAL_MODULE_NAME, values)
    }

    fn validate_module_values(&self, values_key: &str, values: &Value) -> Result<(), ValuesError> {
        Self::validate(self.modules.get(values_key), values_key, values)
    }
}

fn validate_node(schema: &Value, value: &Value, path: &str, violations: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if value.is_null() {
        let nullable = schema
            .get("nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !nullable && schema.contains_key("type") {
            violations.push(format!("{path}: must not be null"));
        }
        return;
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str)
        && !type_matches(expected, value)
    {
        violations.push(format!(
            "{path}: expected {expected}, got {}",
            value_kind(value)
        ));
        return;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array)
        && !allowed.contains(value)
    {
        let allowed: Vec<String> = allowed.iter().map(Value::to_string).collect();
        violations.push(format!(
            "{path}: must be one of [{}], got {value}",
            allowed.join(", ")
        ));
    }

    match value {
        Value::String(s) => validate_string(schema, s, path, violations),
        Value::Number(_) => validate_number(schema, value, path, violations),
        Value::Array(items) => validate_array(schema, items, path, violations),
        Value::Object(map) => validate_object(schema, map, path, violations),
        Value::Bool(_) | Value::Null => {}
    }

    validate_composition(schema, value, path, violations);
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|number| number.fract() == 0.0)
        }
        _ => true,
    }
}

fn validate_string(schema: &Map<String, Value>, s: &str, path: &str, violations: &mut Vec<String>) {
    let length = s.chars().count() as u64;

    if let Some(min) = schema.get("minLength").and_then(Value::as_u64)
        && length < min
    {
        violations.push(format!("{path}: length must be at least {min}"));
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64)
        && length > max
    {
        violations.push(format!("{path}: length must be at most {max}"));
    }

    if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
        match Regex::new(pattern) {
            Ok(regex) if !regex.is_match(s) => {
                violations.push(format!("{path}: must match pattern {pattern:?}"));
            }
            Ok(_) => {}
            Err(_) => violations.push(format!("{path}: schema pattern {pattern:?} is invalid")),
        }
    }
}

fn validate_number(
    schema: &Map<String, Value>,
    value: &Value,
    path: &str,
    violations: &mut Vec<String>,
) {
    let Some(number) = value.as_f64() else {
        return;
    };
    let exclusive = |key: &str| schema.get(key).and_then(Value::as_bool).unwrap_or(false);

    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        let below = if exclusive("exclusiveMinimum") {
            number <= min
        } else {
            number < min
        };
        if below {
            violations.push(format!("{path}: must be greater than or equal to {min}"));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        let above = if exclusive("exclusiveMaximum") {
            number >= max
        } else {
            number > max
        };
        if above {
            violations.push(format!("{path}: must be less than or equal to {max}"));
        }
    }
}

fn validate_array(
    schema: &Map<String, Value>,
    items: &[Value],
    path: &str,
    violations: &mut Vec<String>,
) {
    let count = items.len() as u64;

    if let Some(min) = schema.get("minItems").and_then(Value::as_u64)
        && count < min
    {
        violations.push(format!("{path}: must have at least {min} items"));
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64)
        && count > max
    {
        violations.push(format!("{path}: must have at most {max} items"));
    }

    if let Some(item_schema) = schema.get("items") {
        for (index, item) in items.iter().enumerate() {
            validate_node(item_schema, item, &format!("{path}[{index}]"), violations);
        }
    }
}

fn validate_object(
    schema: &Map<String, Value>,
    map: &Map<String, Value>,
    path: &str,
    violations: &mut Vec<String>,
) {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                violations.push(format!("{path}.{name}: is required"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let preserve_unknown = schema
        .get("x-kubernetes-preserve-unknown-fields")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    for (key, value) in map {
        let child_path = format!("{path}.{key}");

        if let Some(property_schema) = properties.and_then(|properties| properties.get(key)) {
            validate_node(property_schema, value, &child_path, violations);
            continue;
        }

        match schema.get("additionalProperties") {
            Some(Value::Bool(true)) => {}
            Some(Value::Bool(false)) => {
                violations.push(format!("{child_path}: is not allowed"));
            }
            Some(additional @ Value::Object(_)) => {
                validate_node(additional, value, &child_path, violations);
            }
            _ if properties.is_some() && !preserve_unknown => {
                violations.push(format!("{child_path}: is not allowed"));
            }
            _ => {}
        }
    }
}

fn validate_composition(
    schema: &Map<String, Value>,
    value: &Value,
    path: &str,
    violations: &mut Vec<String>,
) {
    let passes = |sub_schema: &Value| {
        let mut sub_violations = Vec::new();
        validate_node(sub_schema, value, path, &mut sub_violations);
        sub_violations
    };

    if let Some(all_of) = schema.get("allOf").and_then(Value::as_array) {
        for sub_schema in all_of {
            violations.extend(passes(sub_schema));
        }
    }

    if let Some(any_of) = schema.get("anyOf").and_then(Value::as_array)
        && !any_of.iter().any(|sub_schema| passes(sub_schema).is_empty())
    {
        violations.push(format!("{path}: must match at least one schema in anyOf"));
    }

    if let Some(one_of) = schema.get("oneOf").and_then(Value::as_array) {
        let matching = one_of
            .iter()
            .filter(|sub_schema| passes(sub_schema).is_empty())
            .count();
        if matching != 1 {
            violations.push(format!(
                "{path}: must match exactly one schema in oneOf, matched {matching}"
            ));
        }
    }
}
