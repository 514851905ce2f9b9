//! Per-execution pipeline state.

use super::intelligence::FailureAnalysis;
use crate::errors::CallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The recorded outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepResult {
    /// Step id.
    pub step_id: String,
    /// Whether the step succeeded.
    pub success: bool,
    /// Whether the step was skipped without running.
    #[serde(default)]
    pub skipped: bool,
    /// Raw result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Declared outputs extracted from the result.
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,
    /// Failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time.
    pub end_time: DateTime<Utc>,
    /// Elapsed milliseconds.
    pub duration_ms: u64,
    /// Retries performed.
    #[serde(default)]
    pub retry_count: u32,
    /// Classification of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_analysis: Option<FailureAnalysis>,
}

impl PipelineStepResult {
    /// A step that did not run.
    #[must_use]
    pub fn skipped(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            success: false,
            skipped: true,
            result: None,
            outputs: HashMap::new(),
            error: Some(CallError::new(crate::errors::ErrorCode::ExecutionError, reason)),
            start_time: now,
            end_time: now,
            duration_ms: 0,
            retry_count: 0,
            failure_analysis: None,
        }
    }

    /// Whether the step failed after running.
    #[must_use]
    pub fn failed(&self) -> bool {
        !self.success && !self.skipped
    }
}

/// A failure kept in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Failing step.
    pub step_id: String,
    /// The error.
    pub error: CallError,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Progress bookkeeping for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    /// Index of the step being run.
    pub current_step: usize,
    /// Number of top-level steps.
    pub total_steps: usize,
    /// Failures in order.
    pub error_history: Vec<ErrorRecord>,
}

/// Mutable state of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    /// Unique execution id.
    pub execution_id: String,
    /// Pipeline id.
    pub pipeline_id: String,
    /// Variable store; later writes win.
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Results by step id.
    pub step_results: HashMap<String, PipelineStepResult>,
    /// Step ids in the order their results were recorded.
    pub result_order: Vec<String>,
    /// Run bookkeeping.
    pub metadata: RunMetadata,
    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl PipelineContext {
    /// Creates a context with a fresh execution id.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, total_steps: usize) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.into(),
            variables: serde_json::Map::new(),
            step_results: HashMap::new(),
            result_order: Vec::new(),
            metadata: RunMetadata {
                total_steps,
                ..RunMetadata::default()
            },
            started_at: Utc::now(),
        }
    }

    /// Merges variables; objects merge key by key, anything else lands under `input`.
    pub fn seed(&mut self, values: serde_json::Value) {
        match values {
            serde_json::Value::Object(map) => self.variables.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.variables.insert("input".to_string(), other);
            }
        }
    }

    /// Returns a variable.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Sets a variable.
    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(name.into(), value);
    }

    /// Returns a step's result.
    #[must_use]
    pub fn step_result(&self, step_id: &str) -> Option<&PipelineStepResult> {
        self.step_results.get(step_id)
    }

    /// Whether a step completed successfully.
    #[must_use]
    pub fn succeeded(&self, step_id: &str) -> bool {
        self.step_results.get(step_id).is_some_and(|r| r.success)
    }

    /// Records a step result, merging its outputs into the variables on success.
    pub fn record(&mut self, result: PipelineStepResult) {
        if result.success {
            for (name, value) in &result.outputs {
                self.variables.insert(name.clone(), value.clone());
            }
        } else if let (false, Some(error)) = (result.skipped, &result.error) {
            self.metadata.error_history.push(ErrorRecord {
                step_id: result.step_id.clone(),
                error: error.clone(),
                timestamp: result.end_time,
            });
        }
        if !self.step_results.contains_key(&result.step_id) {
            self.result_order.push(result.step_id.clone());
        }
        self.step_results.insert(result.step_id.clone(), result);
    }

    /// Results in recording order.
    #[must_use]
    pub fn ordered_results(&self) -> Vec<PipelineStepResult> {
        self.result_order
            .iter()
            .filter_map(|id| self.step_results.get(id).cloned())
            .collect()
    }
}
