//! Resource figures attached to call envelopes and performance samples.

use serde::{Deserialize, Serialize};

/// Resource utilization observed around one call or step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Resident memory in megabytes.
    pub memory_mb: f64,
    /// CPU utilization in percent.
    pub cpu_percent: f64,
}

/// Source of resource figures.
///
/// The crate never fabricates these numbers; wire a provider backed by real
/// process metrics, or use [`NullMetricsProvider`].
pub trait MetricsProvider: Send + Sync {
    /// Samples current resource usage.
    fn sample(&self) -> ResourceUsage;
}

/// Reports zero usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricsProvider;

impl MetricsProvider for NullMetricsProvider {
    fn sample(&self) -> ResourceUsage {
        ResourceUsage::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_provider_reports_zero() {
        assert_eq!(NullMetricsProvider.sample(), ResourceUsage::default());
    }

    #[test]
    fn test_usage_serializes_camel_case() {
        let json = serde_json::to_value(ResourceUsage {
            memory_mb: 12.5,
            cpu_percent: 40.0,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"memoryMb": 12.5, "cpuPercent": 40.0}));
    }
}
