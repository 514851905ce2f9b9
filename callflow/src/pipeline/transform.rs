//! Value transformations for `transform` steps.

use crate::errors::CallError;
use serde::{Deserialize, Serialize};

/// A transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    /// Upper-case a string (element-wise over arrays).
    Uppercase,
    /// Lower-case a string (element-wise over arrays).
    Lowercase,
    /// Trim surrounding whitespace (element-wise over arrays).
    Trim,
    /// Encode any value as JSON text.
    JsonStringify,
    /// Decode JSON text.
    JsonParse,
    /// Coerce to a number.
    ToNumber,
    /// Coerce to a string.
    ToString,
    /// Coerce to a boolean.
    ToBoolean,
}

fn map_strings(
    op: TransformOp,
    value: &serde_json::Value,
    f: &dyn Fn(&str) -> String,
) -> Result<serde_json::Value, CallError> {
    match value {
        serde_json::Value::String(s) => Ok(serde_json::Value::String(f(s))),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| map_strings(op, item, f))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        other => Err(mismatch(op, other)),
    }
}

fn mismatch(op: TransformOp, value: &serde_json::Value) -> CallError {
    CallError::invalid_input(format!("Cannot apply {op:?} to {value}"))
        .with_detail("operation", serde_json::json!(op))
}

fn number(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        serde_json::json!(n as i64)
    } else {
        serde_json::json!(n)
    }
}

/// Applies a transformation.
///
/// # Errors
///
/// Returns `INVALID_INPUT` when the value cannot be transformed.
pub fn apply(op: TransformOp, value: &serde_json::Value) -> Result<serde_json::Value, CallError> {
    match op {
        TransformOp::Uppercase => map_strings(op, value, &str::to_uppercase),
        TransformOp::Lowercase => map_strings(op, value, &str::to_lowercase),
        TransformOp::Trim => map_strings(op, value, &|s| s.trim().to_string()),
        TransformOp::JsonStringify => Ok(serde_json::Value::String(value.to_string())),
        TransformOp::JsonParse => match value {
            serde_json::Value::String(s) => serde_json::from_str(s).map_err(|e| {
                CallError::invalid_input(format!("Invalid JSON: {e}"))
                    .with_detail("operation", serde_json::json!(op))
            }),
            other => Err(mismatch(op, other)),
        },
        TransformOp::ToNumber => match value {
            serde_json::Value::Number(_) => Ok(value.clone()),
            serde_json::Value::Bool(b) => Ok(serde_json::json!(u8::from(*b))),
            serde_json::Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(number)
                .ok_or_else(|| mismatch(op, value)),
            other => Err(mismatch(op, other)),
        },
        TransformOp::ToString => Ok(serde_json::Value::String(match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })),
        TransformOp::ToBoolean => Ok(serde_json::Value::Bool(match value {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            serde_json::Value::String(s) => !matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "" | "false" | "0" | "no" | "off"
            ),
            serde_json::Value::Array(a) => !a.is_empty(),
            serde_json::Value::Object(o) => !o.is_empty(),
        })),
    }
}
