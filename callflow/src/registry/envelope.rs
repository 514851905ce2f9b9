//! Uniform result envelope for service calls.

use crate::errors::CallError;
use crate::observability::{ResourceUsage, SpanTimer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timing and resource figures for one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetrics {
    /// When the call started.
    pub start_time: DateTime<Utc>,
    /// When the call finished.
    pub end_time: DateTime<Utc>,
    /// Elapsed time in milliseconds.
    pub duration: u64,
    /// Resource usage sampled at completion.
    pub resource_usage: ResourceUsage,
    /// HTTP attempts made, for external calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl CallMetrics {
    /// Closes a timer into call metrics.
    #[must_use]
    pub fn from_timer(timer: SpanTimer, resource_usage: ResourceUsage) -> Self {
        let start_time = timer.started_at();
        let duration = timer.finish();
        Self {
            start_time,
            end_time: Utc::now(),
            duration,
            resource_usage,
            attempts: None,
        }
    }

    /// Records the number of attempts.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// Outcome of [`ServiceRegistry::execute_call`](super::ServiceRegistry::execute_call).
///
/// Exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    /// Whether the call succeeded.
    pub success: bool,
    /// The payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// The structured error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// Timing and resource figures.
    pub metrics: CallMetrics,
}

impl CallResult {
    /// Creates a successful result.
    #[must_use]
    pub fn ok(data: serde_json::Value, metrics: CallMetrics) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metrics,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn err(error: CallError, metrics: CallMetrics) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metrics,
        }
    }

    /// Converts into a standard `Result`, dropping the metrics.
    pub fn into_result(self) -> Result<serde_json::Value, CallError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}
