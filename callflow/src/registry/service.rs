//! Registered services, their methods and health records.

use super::external::ExternalApiConfig;
use crate::errors::{CallError, ErrorCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Kind of callable a service wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// A single tool.
    Tool,
    /// An agent.
    Agent,
    /// A team of agents.
    Team,
    /// A pipeline.
    Pipeline,
}

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Accepting calls.
    #[default]
    Active,
    /// Administratively disabled.
    Inactive,
    /// Health has dropped to unhealthy.
    Error,
}

/// A declared input parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Type name, e.g. `string`.
    #[serde(rename = "type")]
    pub param_type: String,
    /// Whether the parameter must be supplied.
    #[serde(default)]
    pub required: bool,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// Creates a parameter spec.
    #[must_use]
    pub fn new(name: impl Into<String>, param_type: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            required,
            description: None,
        }
    }
}

/// Identity and declaration of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    /// Unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Kind of service.
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    /// Lifecycle status.
    #[serde(default)]
    pub status: ServiceStatus,
    /// Declared input parameters.
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Free-form metadata.
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl ServiceMetadata {
    /// Creates metadata for an active service.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        service_type: ServiceType,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            service_type,
            status: ServiceStatus::Active,
            parameters: Vec::new(),
            custom: HashMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Adds a custom metadata entry.
    #[must_use]
    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Checks the required identity fields.
    ///
    /// # Errors
    ///
    /// Returns a `REGISTRATION_FAILED` error naming the first empty field.
    pub fn validate(&self) -> Result<(), CallError> {
        for (field, value) in [("id", &self.id), ("name", &self.name), ("version", &self.version)] {
            if value.trim().is_empty() {
                return Err(CallError::new(
                    ErrorCode::RegistrationFailed,
                    format!("Service metadata field '{field}' is required"),
                ));
            }
        }
        Ok(())
    }
}

/// A locally-implemented service method.
///
/// Errors are reported as [`CallError`] when the handler returns one through
/// `anyhow`, and as `EXECUTION_ERROR` otherwise.
#[async_trait]
pub trait ServiceMethod: Send + Sync {
    /// Invokes the method.
    async fn invoke(&self, request: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> ServiceMethod for FnMethod<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send,
{
    async fn invoke(&self, request: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        (self.0)(request).await
    }
}

/// Wraps an async closure as a [`ServiceMethod`].
pub fn method_fn<F, Fut>(f: F) -> Arc<dyn ServiceMethod>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnMethod(f))
}

/// Maps a handler error to a call error, preserving a wrapped [`CallError`].
#[must_use]
pub fn handler_error(err: anyhow::Error) -> CallError {
    match err.downcast::<CallError>() {
        Ok(call) => call,
        Err(other) => CallError::execution(other.to_string()),
    }
}

/// A service as handed to the registry.
#[derive(Clone)]
pub struct RegisteredService {
    /// Identity and declaration.
    pub metadata: ServiceMetadata,
    /// Local methods by name.
    pub methods: HashMap<String, Arc<dyn ServiceMethod>>,
    /// Remote-backed methods by name.
    pub external: HashMap<String, ExternalApiConfig>,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut local: Vec<_> = self.methods.keys().collect();
        local.sort();
        let mut remote: Vec<_> = self.external.keys().collect();
        remote.sort();
        f.debug_struct("RegisteredService")
            .field("metadata", &self.metadata)
            .field("methods", &local)
            .field("external", &remote)
            .finish()
    }
}

impl RegisteredService {
    /// Creates a service with no methods.
    #[must_use]
    pub fn new(metadata: ServiceMetadata) -> Self {
        Self {
            metadata,
            methods: HashMap::new(),
            external: HashMap::new(),
        }
    }

    /// Adds a local method.
    #[must_use]
    pub fn with_method(mut self, name: impl Into<String>, method: Arc<dyn ServiceMethod>) -> Self {
        self.methods.insert(name.into(), method);
        self
    }

    /// Adds a remote-backed method.
    #[must_use]
    pub fn with_external(mut self, name: impl Into<String>, config: ExternalApiConfig) -> Self {
        self.external.insert(name.into(), config);
        self
    }

    /// Returns the id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Returns the number of callable methods.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len() + self.external.len()
    }

    /// Returns whether a method of that name exists.
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.external.contains_key(name)
    }
}

/// Coarse health derived from the smoothed success rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Success rate at or above 0.9.
    #[default]
    Healthy,
    /// Success rate at or above 0.5.
    Degraded,
    /// Success rate below 0.5.
    Unhealthy,
}

impl HealthStatus {
    /// Derives the status from a success rate.
    #[must_use]
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.9 {
            Self::Healthy
        } else if rate >= 0.5 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

/// Exponentially-smoothed call statistics for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    /// Derived status.
    pub status: HealthStatus,
    /// Smoothed success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Smoothed latency in milliseconds.
    pub average_latency: f64,
    /// Smoothed error rate in `[0, 1]`.
    pub error_rate: f64,
    /// When the record was last updated.
    pub last_check: DateTime<Utc>,
    /// Calls observed.
    pub total_calls: u64,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            success_rate: 1.0,
            average_latency: 0.0,
            error_rate: 0.0,
            last_check: Utc::now(),
            total_calls: 0,
        }
    }
}

impl ServiceHealth {
    /// Folds one call outcome into the record.
    ///
    /// `history_weight` is the weight kept by the old value, e.g. 0.9.
    pub fn record(&mut self, success: bool, latency_ms: u64, history_weight: f64) {
        let w = history_weight.clamp(0.0, 1.0);
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = self.success_rate * w + outcome * (1.0 - w);
        self.error_rate = self.error_rate * w + (1.0 - outcome) * (1.0 - w);
        self.average_latency = self.average_latency * w + latency_ms as f64 * (1.0 - w);
        self.status = HealthStatus::from_success_rate(self.success_rate);
        self.last_check = Utc::now();
        self.total_calls += 1;
    }
}
