//! Schema conformance for document payloads and equality filters for queries.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::{DbError, DbResult};
use crate::models::{DocumentData, FieldType, Schema};

/// Equality filters: field name to acceptable values. Values of one field are
/// OR-ed, fields are AND-ed.
pub type Filters = HashMap<String, Vec<String>>;

/// Parse a wire field map (`name -> "string" | "number" | "bool"`).
pub fn parse_fields(raw: &BTreeMap<String, String>) -> DbResult<BTreeMap<String, FieldType>> {
    if raw.is_empty() {
        return Err(DbError::ValidationFailed(
            "schema must have at least one field".to_string(),
        ));
    }

    raw.iter()
        .map(|(name, kind)| {
            if name.is_empty() {
                return Err(DbError::ValidationFailed(
                    "field name cannot be empty".to_string(),
                ));
            }
            let field_type = kind.parse::<FieldType>().map_err(|e| {
                DbError::ValidationFailed(format!("field '{}': {}", name, e))
            })?;
            Ok((name.clone(), field_type))
        })
        .collect()
}

/// Every field in `data` must be declared with a matching type, and every
/// declared field must be present.
pub fn validate_document(data: &DocumentData, schema: &Schema) -> DbResult<()> {
    if data.is_empty() {
        return Err(DbError::ValidationFailed(
            "document data cannot be empty".to_string(),
        ));
    }

    for (name, value) in data {
        let expected = schema.fields.get(name).ok_or_else(|| {
            DbError::ValidationFailed(format!("field '{}' is not defined in schema", name))
        })?;
        if !value_has_type(value, *expected) {
            return Err(DbError::ValidationFailed(format!(
                "field '{}' must be a {}, got {}",
                name,
                expected,
                json_type_name(value)
            )));
        }
    }

    for name in schema.fields.keys() {
        if !data.contains_key(name) {
            return Err(DbError::ValidationFailed(format!(
                "required field '{}' is missing",
                name
            )));
        }
    }

    Ok(())
}

fn value_has_type(value: &Value, expected: FieldType) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Bool => value.is_boolean(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether `data` satisfies every filter on a field declared by `schema`.
/// Filters on undeclared fields and empty value lists are ignored.
pub fn matches_filters(data: &DocumentData, schema: &Schema, filters: &Filters) -> bool {
    filters.iter().all(|(name, wanted)| {
        let Some(field_type) = schema.fields.get(name) else {
            return true;
        };
        if wanted.is_empty() {
            return true;
        }
        match data.get(name) {
            Some(value) => wanted
                .iter()
                .any(|candidate| value_matches(value, *field_type, candidate)),
            None => false,
        }
    })
}

fn value_matches(value: &Value, field_type: FieldType, candidate: &str) -> bool {
    match field_type {
        FieldType::String => value.as_str() == Some(candidate),
        FieldType::Number => match (value.as_f64(), candidate.trim().parse::<f64>()) {
            (Some(actual), Ok(wanted)) => actual == wanted,
            _ => false,
        },
        FieldType::Bool => match (value.as_bool(), parse_bool(candidate)) {
            (Some(actual), Some(wanted)) => actual == wanted,
            _ => false,
        },
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
