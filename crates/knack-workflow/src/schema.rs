//! Lightweight argument checking against a tool's declared input
//! schema. This is not a full JSON Schema validator; it covers the
//! two checks that catch real authoring mistakes before a tool call
//! goes out: required properties are present, and present properties
//! have the declared primitive type.

use serde_json::{Map, Value};

/// Checks `arguments` against `schema`. Schemas that are not objects,
/// or that declare a type other than `"object"`, are accepted as-is.
pub fn check_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !arguments.contains_key(name) {
                return Err(format!("missing required argument '{name}'"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, value) in arguments {
            let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
                continue;
            };
            if !type_matches(declared, value) {
                return Err(format!(
                    "argument '{name}' should be {} but is {}",
                    type_name(declared),
                    value_kind(value)
                ));
            }
        }
    }

    Ok(())
}

/// `declared` is a schema `type` field: a string or an array of
/// strings. Unknown shapes match everything.
fn type_matches(declared: &Value, value: &Value) -> bool {
    match declared {
        Value::String(tag) => matches_one(tag, value),
        Value::Array(tags) => tags
            .iter()
            .filter_map(Value::as_str)
            .any(|tag| matches_one(tag, value)),
        _ => true,
    }
}

fn matches_one(tag: &str, value: &Value) -> bool {
    match tag {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(declared: &Value) -> String {
    match declared {
        Value::String(tag) => article(tag),
        Value::Array(tags) => tags
            .iter()
            .filter_map(Value::as_str)
            .map(article)
            .collect::<Vec<_>>()
            .join(" or "),
        _ => "any type".to_string(),
    }
}

fn article(tag: &str) -> String {
    match tag {
        "integer" | "array" | "object" => format!("an {tag}"),
        "null" => "null".to_string(),
        other => format!("a {other}"),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
