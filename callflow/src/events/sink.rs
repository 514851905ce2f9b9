//! Context sink trait and implementations.

use crate::errors::CallError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Level};

/// Kind of context record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEventKind {
    /// A call or step completed.
    Execution,
    /// A call or step failed.
    Error,
    /// A service was registered, unregistered or changed status.
    Service,
}

/// A record delivered to a [`ContextSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    /// Record kind.
    pub kind: ContextEventKind,
    /// Service id, or `execution_id:step_id` for pipeline steps.
    pub scope: String,
    /// Record payload.
    pub data: serde_json::Value,
    /// The error, for error records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

/// Receives execution, error and service-lifecycle records.
///
/// Methods must not block or fail; implementations swallow their own errors.
pub trait ContextSink: Send + Sync {
    /// Records a completed call or step.
    fn record_execution_context(&self, scope: &str, data: serde_json::Value);

    /// Records a failed call or step.
    fn record_error_context(&self, scope: &str, error: &CallError, data: serde_json::Value);

    /// Records a service lifecycle change.
    fn update_service_context(&self, service_id: &str, data: serde_json::Value);
}

/// Discards every record. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpContextSink;

impl ContextSink for NoOpContextSink {
    fn record_execution_context(&self, _scope: &str, _data: serde_json::Value) {}

    fn record_error_context(&self, _scope: &str, _error: &CallError, _data: serde_json::Value) {}

    fn update_service_context(&self, _service_id: &str, _data: serde_json::Value) {}
}

/// Writes records to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingContextSink {
    level: Level,
}

impl Default for LoggingContextSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingContextSink {
    /// Creates a sink logging at the given level; errors always log at warn.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ContextSink for LoggingContextSink {
    fn record_execution_context(&self, scope: &str, data: serde_json::Value) {
        if self.level == Level::DEBUG {
            debug!(scope, context = %data, "Execution context");
        } else {
            info!(scope, context = %data, "Execution context");
        }
    }

    fn record_error_context(&self, scope: &str, error: &CallError, data: serde_json::Value) {
        warn!(scope, code = %error.code, error = %error.message, context = %data, "Error context");
    }

    fn update_service_context(&self, service_id: &str, data: serde_json::Value) {
        if self.level == Level::DEBUG {
            debug!(service_id, context = %data, "Service context");
        } else {
            info!(service_id, context = %data, "Service context");
        }
    }
}

/// Keeps every record in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingContextSink {
    events: parking_lot::RwLock<Vec<ContextEvent>>,
}

impl CollectingContextSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every record.
    #[must_use]
    pub fn events(&self) -> Vec<ContextEvent> {
        self.events.read().clone()
    }

    /// Returns records of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: ContextEventKind) -> Vec<ContextEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all records.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    fn push(&self, kind: ContextEventKind, scope: &str, data: serde_json::Value, error: Option<CallError>) {
        self.events.write().push(ContextEvent {
            kind,
            scope: scope.to_string(),
            data,
            error,
        });
    }
}

impl ContextSink for CollectingContextSink {
    fn record_execution_context(&self, scope: &str, data: serde_json::Value) {
        self.push(ContextEventKind::Execution, scope, data, None);
    }

    fn record_error_context(&self, scope: &str, error: &CallError, data: serde_json::Value) {
        self.push(ContextEventKind::Error, scope, data, Some(error.clone()));
    }

    fn update_service_context(&self, service_id: &str, data: serde_json::Value) {
        self.push(ContextEventKind::Service, service_id, data, None);
    }
}
