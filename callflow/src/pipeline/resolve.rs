//! Step input and output resolution.
//!
//! Input values are resolved recursively:
//! - `"$name"` / `"$name.path"` reads a context variable
//! - `"@step"` / `"@step.path"` reads a prior step's raw result
//! - anything else is taken literally
//!
//! Paths use dotted keys and bracketed indexes, e.g. `items[0].title`.

use super::context::PipelineContext;
use super::definition::PipelineStepDefinition;
use tracing::debug;

/// One segment of a value path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

/// Splits a path like `a.b[0].c` into segments.
///
/// Empty keys are dropped and malformed brackets are read as keys.
#[must_use]
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        if key_end > 0 {
            segments.push(PathSegment::Key(rest[..key_end].to_string()));
        }
        rest = &rest[key_end..];

        while let Some(stripped) = rest.strip_prefix('[') {
            let Some(close) = stripped.find(']') else {
                segments.push(PathSegment::Key(rest.to_string()));
                break;
            };
            let inner = &stripped[..close];
            match inner.trim().parse::<usize>() {
                Ok(index) => segments.push(PathSegment::Index(index)),
                Err(_) => segments.push(PathSegment::Key(inner.trim_matches(['"', '\'']).to_string())),
            }
            rest = &stripped[close + 1..];
        }
    }
    segments
}

/// Reads a path from a value.
#[must_use]
pub fn get_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    parse_path(path)
        .iter()
        .try_fold(value, |current, segment| match segment {
            PathSegment::Key(key) => current.get(key.as_str()),
            PathSegment::Index(index) => current.get(*index),
        })
}

fn split_reference(reference: &str) -> (&str, &str) {
    let end = reference.find(['.', '[']).unwrap_or(reference.len());
    let (head, tail) = reference.split_at(end);
    (head, tail.strip_prefix('.').unwrap_or(tail))
}

fn lookup(root: Option<&serde_json::Value>, path: &str) -> serde_json::Value {
    let found = match root {
        Some(value) if path.is_empty() => Some(value),
        Some(value) => get_path(value, path),
        None => None,
    };
    found.cloned().unwrap_or(serde_json::Value::Null)
}

/// Resolves one declared input value against the context.
#[must_use]
pub fn resolve_value(spec: &serde_json::Value, ctx: &PipelineContext) -> serde_json::Value {
    match spec {
        serde_json::Value::String(s) => {
            if let Some(reference) = s.strip_prefix('$') {
                let (name, path) = split_reference(reference);
                lookup(ctx.variable(name), path)
            } else if let Some(reference) = s.strip_prefix('@') {
                let (step_id, path) = split_reference(reference);
                let result = ctx.step_result(step_id).and_then(|r| r.result.as_ref());
                lookup(result, path)
            } else {
                spec.clone()
            }
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolves a step's inputs into an object.
///
/// A dynamic input function takes precedence; a non-object value it returns
/// is placed under `input`.
#[must_use]
pub fn resolve_inputs(
    step: &PipelineStepDefinition,
    ctx: &PipelineContext,
) -> serde_json::Map<String, serde_json::Value> {
    if let Some(input_fn) = &step.input_fn {
        return match input_fn(ctx) {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
    }

    step.inputs
        .iter()
        .map(|(name, spec)| (name.clone(), resolve_value(spec, ctx)))
        .collect()
}

/// Extracts declared outputs from a step result. Missing paths are skipped.
#[must_use]
pub fn extract_outputs(
    step: &PipelineStepDefinition,
    result: &serde_json::Value,
) -> std::collections::HashMap<String, serde_json::Value> {
    step.outputs
        .iter()
        .filter_map(|(variable, path)| {
            let value = if path.is_empty() || path == "$" {
                Some(result)
            } else {
                get_path(result, path)
            };
            if value.is_none() {
                debug!(step_id = %step.id, variable, path, "Output path not present in result");
            }
            value.map(|v| (variable.clone(), v.clone()))
        })
        .collect()
}
