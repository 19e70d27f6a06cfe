//! Task output contract.

use serde_json::Value;

use crate::error::OutputError;

/// Check that `output` can be reported as a completed run.
///
/// Outputs must be a JSON object (`null` is accepted as "no output") and may
/// not contain a NUL character anywhere, including object keys.
pub fn validate_output(output: &Value) -> Result<(), OutputError> {
    match output {
        Value::Object(_) | Value::Null => {}
        other => {
            return Err(OutputError::NotAnObject {
                kind: kind_of(other),
            });
        }
    }
    if contains_nul(output) {
        return Err(OutputError::NulCharacter);
    }
    Ok(())
}

/// Serialize a validated output.
pub fn serialize_output(output: &Value) -> Result<String, OutputError> {
    validate_output(output)?;
    Ok(serde_json::to_string(output)?)
}

fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(map) => map
            .iter()
            .any(|(key, value)| key.contains('\0') || contains_nul(value)),
        _ => false,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
