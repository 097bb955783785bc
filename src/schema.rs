//! Tool-parameter schema sanitizer.
//!
//! The backend validates function declarations against a restricted subset of
//! JSON Schema. [`clean`] rebuilds a schema without the keywords it rejects;
//! the input value is never mutated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Keywords the backend never accepts.
const UNSUPPORTED: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "patternProperties",
    "additionalItems",
    "contains",
    "propertyNames",
    "if",
    "then",
    "else",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
];

/// Constraint keywords dropped only for strict targets.
const STRICT_ONLY: &[&str] = &[
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "pattern",
    "format",
    "default",
    "example",
    "examples",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    #[default]
    Standard,
    Strict,
}

/// Clean a schema for the standard backend validator.
pub fn clean(schema: &Value) -> Value {
    clean_with(schema, Strictness::Standard)
}

pub fn clean_with(schema: &Value, strictness: Strictness) -> Value {
    match schema {
        Value::Object(map) => Value::Object(clean_object(map, strictness)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| clean_with(item, strictness))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn clean_object(map: &Map<String, Value>, strictness: Strictness) -> Map<String, Value> {
    let mut cleaned = Map::new();
    let mut lower: Option<Number> = None;
    let mut upper: Option<Number> = None;

    for (key, value) in map {
        match key.as_str() {
            "exclusiveMinimum" => {
                lower = shift(value, 1);
                continue;
            }
            "exclusiveMaximum" => {
                upper = shift(value, -1);
                continue;
            }
            k if UNSUPPORTED.contains(&k) => continue,
            k if strictness == Strictness::Strict && STRICT_ONLY.contains(&k) => continue,
            _ => {}
        }

        let value = match (key.as_str(), value) {
            // Property names are user data, not keywords.
            ("properties", Value::Object(props)) => Value::Object(
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), clean_with(prop, strictness)))
                    .collect(),
            ),
            _ => clean_with(value, strictness),
        };
        cleaned.insert(key.clone(), value);
    }

    if let Some(bound) = lower {
        merge_bound(&mut cleaned, "minimum", bound, |new, old| new > old);
    }
    if let Some(bound) = upper {
        merge_bound(&mut cleaned, "maximum", bound, |new, old| new < old);
    }

    cleaned
}

/// Keep the tighter of an explicit bound and one derived from an exclusive bound.
fn merge_bound(
    cleaned: &mut Map<String, Value>,
    key: &str,
    bound: Number,
    tighter: fn(f64, f64) -> bool,
) {
    let replace = match cleaned.get(key).and_then(Value::as_f64) {
        Some(existing) => bound.as_f64().is_some_and(|b| tighter(b, existing)),
        None => true,
    };
    if replace {
        cleaned.insert(key.to_string(), Value::Number(bound));
    }
}

/// Apply the inclusive adjustment. Only exact for integer bounds; fractional
/// bounds are shifted by the same amount.
fn shift(value: &Value, delta: i64) -> Option<Number> {
    let n = value.as_number()?;
    if let Some(i) = n.as_i64() {
        return i.checked_add(delta).map(Number::from);
    }
    if let Some(u) = n.as_u64() {
        return u.checked_add_signed(delta).map(Number::from);
    }
    n.as_f64().and_then(|f| Number::from_f64(f + delta as f64))
}
