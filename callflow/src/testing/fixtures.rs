//! Ready-made services and metrics for tests.

use crate::errors::CallError;
use crate::observability::{MetricsProvider, ResourceUsage};
use crate::registry::{method_fn, RegisteredService, ServiceMetadata, ServiceRegistry, ServiceType};
use std::sync::Arc;

/// Reports fixed resource figures.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StaticMetricsProvider {
    usage: ResourceUsage,
}

impl StaticMetricsProvider {
    /// Creates a provider reporting the given memory and CPU figures.
    #[must_use]
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        Self {
            usage: ResourceUsage {
                memory_mb,
                cpu_percent,
            },
        }
    }
}

impl MetricsProvider for StaticMetricsProvider {
    fn sample(&self) -> ResourceUsage {
        self.usage
    }
}

/// A tool service with `echo` (returns its request) and `fail` (always errors).
#[must_use]
pub fn echo_service(id: &str) -> RegisteredService {
    RegisteredService::new(ServiceMetadata::new(id, id, "1.0.0", ServiceType::Tool))
        .with_method("echo", method_fn(|request| async move { Ok(request) }))
        .with_method(
            "fail",
            method_fn(|_| async { Err(anyhow::anyhow!("echo service failure")) }),
        )
}

/// A registry without HTTP holding [`echo_service`] under the id `echo`.
pub fn echo_registry() -> Result<Arc<ServiceRegistry>, CallError> {
    let registry = ServiceRegistry::without_http();
    registry.register_service(echo_service("echo"))?;
    Ok(Arc::new(registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_registry() {
        let registry = echo_registry().unwrap();
        let ok = registry.execute_call("echo", "echo", serde_json::json!({"a": 1})).await;
        assert_eq!(ok.data, Some(serde_json::json!({"a": 1})));
        assert!(!registry.execute_call("echo", "fail", serde_json::Value::Null).await.success);
    }

    #[test]
    fn test_static_metrics() {
        let usage = StaticMetricsProvider::new(128.0, 5.0).sample();
        assert!((usage.memory_mb - 128.0).abs() < f64::EPSILON);
    }
}
