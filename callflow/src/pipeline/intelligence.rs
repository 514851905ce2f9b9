//! Resilient step execution and performance analysis.
//!
//! [`PipelineIntelligence::execute_step`] wraps a step operation with a retry
//! loop, a per-step circuit breaker, a cancelling timeout and failure
//! classification. Each successful step leaves a [`PerformanceSample`] from
//! which [`PipelineIntelligence::generate_performance_profile`] derives an
//! advisory report.

use crate::cancellation::CancellationToken;
use crate::errors::{CallError, ErrorCode};
use crate::observability::{ResourceUsage, SpanTimer};
use crate::resilience::{BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, KeyedStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::observability::{MetricsProvider, NullMetricsProvider};

fn default_max_retries() -> u32 {
    3
}

fn default_step_breaker() -> Option<CircuitBreakerConfig> {
    Some(CircuitBreakerConfig::default())
}

/// Retry, breaker and timeout settings for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedRetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Per-step breaker; `null` disables it.
    #[serde(default = "default_step_breaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Per-attempt timeout.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Patterns marking an error as retryable.
    #[serde(default)]
    pub retryable_errors: Vec<String>,
    /// Patterns marking an error as critical.
    #[serde(default)]
    pub critical_errors: Vec<String>,
}

impl Default for EnhancedRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffPolicy::default(),
            circuit_breaker: default_step_breaker(),
            timeout_ms: None,
            retryable_errors: Vec::new(),
            critical_errors: Vec::new(),
        }
    }
}

impl EnhancedRetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets or disables the per-step breaker.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: Option<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Adds a retryable-error pattern.
    #[must_use]
    pub fn with_retryable_error(mut self, pattern: impl Into<String>) -> Self {
        self.retryable_errors.push(pattern.into());
        self
    }

    /// Adds a critical-error pattern.
    #[must_use]
    pub fn with_critical_error(mut self, pattern: impl Into<String>) -> Self {
        self.critical_errors.push(pattern.into());
        self
    }
}

/// Broad failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    /// Likely to succeed on retry.
    Transient,
    /// Will fail again with the same input.
    Persistent,
    /// Must stop the step.
    Critical,
    /// Resource exhaustion.
    Resource,
    /// Exceeded its time budget.
    Timeout,
}

/// How serious a failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Expected noise.
    Low,
    /// Worth watching.
    Medium,
    /// Needs attention.
    High,
    /// Stops work.
    Critical,
}

/// Recommended reaction to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    /// Try again.
    Retry,
    /// Move on without this step.
    Skip,
    /// Use an alternative.
    Fallback,
    /// Stop.
    Abort,
}

/// Classification of one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    /// Category.
    pub category: FailureCategory,
    /// Severity.
    pub severity: Severity,
    /// Whether another attempt may help.
    pub is_retryable: bool,
    /// Recommended reaction.
    pub suggested_action: SuggestedAction,
    /// Confidence in the classification, `0..=1`.
    pub confidence: f64,
}

impl FailureAnalysis {
    fn new(
        category: FailureCategory,
        severity: Severity,
        is_retryable: bool,
        suggested_action: SuggestedAction,
        confidence: f64,
    ) -> Self {
        Self {
            category,
            severity,
            is_retryable,
            suggested_action,
            confidence,
        }
    }
}

fn matches_any(patterns: &[String], message: &str) -> bool {
    patterns.iter().any(|pattern| match Regex::new(&format!("(?i){pattern}")) {
        Ok(re) => re.is_match(message),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Ignoring invalid error pattern");
            false
        }
    })
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classifies a failure of the given 1-based attempt.
///
/// Policy patterns are consulted first (critical before retryable), then the
/// error code and message keywords.
#[must_use]
pub fn classify_failure(
    error: &CallError,
    attempt: u32,
    policy: &EnhancedRetryPolicy,
) -> FailureAnalysis {
    use FailureCategory as C;
    use SuggestedAction as A;

    if matches_any(&policy.critical_errors, &error.message) {
        return FailureAnalysis::new(C::Critical, Severity::Critical, false, A::Abort, 0.95);
    }
    if matches_any(&policy.retryable_errors, &error.message) {
        return FailureAnalysis::new(C::Transient, Severity::Low, true, A::Retry, 0.9);
    }

    let message = error.message.to_lowercase();
    match error.code {
        ErrorCode::Cancelled => {
            return FailureAnalysis::new(C::Critical, Severity::High, false, A::Abort, 1.0)
        }
        ErrorCode::Timeout => {
            return FailureAnalysis::new(C::Timeout, Severity::Medium, true, A::Retry, 0.9)
        }
        ErrorCode::AuthenticationFailed => {
            return FailureAnalysis::new(C::Critical, Severity::Critical, false, A::Abort, 0.9)
        }
        ErrorCode::ServiceNotFound | ErrorCode::MethodNotFound | ErrorCode::InvalidInput => {
            return FailureAnalysis::new(C::Persistent, Severity::High, false, A::Skip, 0.9)
        }
        _ => {}
    }

    if contains_any(&message, &["timeout", "timed out"]) {
        FailureAnalysis::new(C::Timeout, Severity::Medium, true, A::Retry, 0.8)
    } else if contains_any(&message, &["network", "connection", "econnreset", "econnrefused", "socket"]) {
        FailureAnalysis::new(C::Transient, Severity::Low, true, A::Retry, 0.8)
    } else if contains_any(&message, &["memory", "cpu", "resource"]) {
        let retryable = attempt <= 2;
        let action = if retryable { A::Retry } else { A::Fallback };
        FailureAnalysis::new(C::Resource, Severity::High, retryable, action, 0.7)
    } else if contains_any(&message, &["unauthorized", "auth", "permission", "forbidden"]) {
        FailureAnalysis::new(C::Critical, Severity::Critical, false, A::Abort, 0.85)
    } else if contains_any(&message, &["not found", "invalid"]) {
        FailureAnalysis::new(C::Persistent, Severity::Medium, false, A::Skip, 0.8)
    } else {
        FailureAnalysis::new(C::Transient, Severity::Low, true, A::Retry, 0.5)
    }
}

/// Identifies a step execution.
#[derive(Debug, Clone, Copy)]
pub struct StepTarget<'a> {
    /// Pipeline execution id.
    pub execution_id: &'a str,
    /// Step id.
    pub step_id: &'a str,
    /// Whether the step declares dependencies.
    pub has_dependencies: bool,
}

impl StepTarget<'_> {
    fn breaker_key(&self) -> String {
        format!("{}:{}", self.execution_id, self.step_id)
    }
}

/// Result of a resilient step execution.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Final value or last error.
    pub outcome: Result<serde_json::Value, CallError>,
    /// Retries performed after the first attempt.
    pub retry_count: u32,
    /// Total elapsed milliseconds including backoff.
    pub duration_ms: u64,
    /// Classification of the last failure.
    pub analysis: Option<FailureAnalysis>,
}

/// One successful step's performance figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    /// Step id.
    pub step_id: String,
    /// Duration of the successful attempt.
    pub duration_ms: u64,
    /// Resource figures from the metrics provider.
    pub resource_usage: ResourceUsage,
    /// Detected bottleneck factors: `duration`, `memory`, `cpu`, `dependency`.
    pub bottleneck_factors: Vec<String>,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// A step flagged as slow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    /// Step id.
    pub step_id: String,
    /// Its duration.
    pub duration_ms: u64,
    /// Its bottleneck factors.
    pub factors: Vec<String>,
}

/// Kind of optimization suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Independent steps that could run concurrently.
    Parallelization,
    /// Steps with heavy resource use.
    ResourceOptimization,
    /// Steps that run long.
    LongRunning,
}

/// An advisory optimization hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSuggestion {
    /// Kind.
    pub kind: SuggestionKind,
    /// Steps concerned.
    pub step_ids: Vec<String>,
    /// Human-readable hint.
    pub description: String,
}

/// Aggregated performance report for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceProfile {
    /// Sum of sampled durations.
    pub total_duration_ms: u64,
    /// Number of samples.
    pub step_count: usize,
    /// Mean sampled duration.
    pub average_duration_ms: f64,
    /// Steps over the bottleneck multiple of the mean.
    pub bottlenecks: Vec<Bottleneck>,
    /// Steps with high memory or CPU figures.
    pub high_resource_steps: Vec<String>,
    /// Suggestions.
    pub suggestions: Vec<OptimizationSuggestion>,
    /// The underlying samples.
    pub samples: Vec<PerformanceSample>,
}

fn default_bottleneck_multiplier() -> f64 {
    2.0
}

fn default_high_memory_mb() -> f64 {
    512.0
}

fn default_high_cpu_percent() -> f64 {
    80.0
}

fn default_long_running_ms() -> u64 {
    5000
}

/// Intelligence-layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntelligenceConfig {
    /// Policy for steps without their own.
    #[serde(default)]
    pub default_policy: EnhancedRetryPolicy,
    /// Multiple of the mean duration that marks a bottleneck.
    #[serde(default = "default_bottleneck_multiplier")]
    pub bottleneck_multiplier: f64,
    /// Memory figure that counts as high.
    #[serde(default = "default_high_memory_mb")]
    pub high_memory_mb: f64,
    /// CPU figure that counts as high.
    #[serde(default = "default_high_cpu_percent")]
    pub high_cpu_percent: f64,
    /// Duration that counts as long-running.
    #[serde(default = "default_long_running_ms")]
    pub long_running_ms: u64,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            default_policy: EnhancedRetryPolicy::default(),
            bottleneck_multiplier: default_bottleneck_multiplier(),
            high_memory_mb: default_high_memory_mb(),
            high_cpu_percent: default_high_cpu_percent(),
            long_running_ms: default_long_running_ms(),
        }
    }
}

/// Outcome of one attempt.
enum Attempt {
    Done(Result<serde_json::Value, CallError>),
    TimedOut(u64),
}

/// Resilient step runner owning per-step breakers and performance samples.
pub struct PipelineIntelligence {
    config: IntelligenceConfig,
    breakers: KeyedStore<CircuitBreaker>,
    samples: DashMap<String, Vec<PerformanceSample>>,
    metrics: Arc<dyn MetricsProvider>,
}

impl std::fmt::Debug for PipelineIntelligence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineIntelligence")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl Default for PipelineIntelligence {
    fn default() -> Self {
        Self::new(IntelligenceConfig::default())
    }
}

impl PipelineIntelligence {
    /// Creates an intelligence layer with zeroed resource metrics.
    #[must_use]
    pub fn new(config: IntelligenceConfig) -> Self {
        Self {
            config,
            breakers: KeyedStore::new(),
            samples: DashMap::new(),
            metrics: Arc::new(NullMetricsProvider),
        }
    }

    /// Sets the metrics provider.
    #[must_use]
    pub fn with_metrics_provider(mut self, metrics: Arc<dyn MetricsProvider>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &IntelligenceConfig {
        &self.config
    }

    /// Returns the default policy.
    #[must_use]
    pub fn default_policy(&self) -> &EnhancedRetryPolicy {
        &self.config.default_policy
    }

    /// Returns the breaker for a step, if one has been created.
    #[must_use]
    pub fn step_breaker(&self, execution_id: &str, step_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(&format!("{execution_id}:{step_id}"))
    }

    /// Runs `op` with retries, breaker and timeout.
    ///
    /// `op` receives a fresh child of `cancel` per attempt; that token is
    /// cancelled when the attempt times out so the work actually stops.
    pub async fn execute_step<F, Fut>(
        &self,
        target: StepTarget<'_>,
        policy: &EnhancedRetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> StepExecution
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, CallError>>,
    {
        let timer = SpanTimer::start(target.step_id);
        let breaker = policy
            .circuit_breaker
            .as_ref()
            .map(|cfg| self.breakers.get_or_insert_with(&target.breaker_key(), || CircuitBreaker::new(cfg.clone())));

        let mut permit = match &breaker {
            Some(breaker) => match breaker.admit() {
                Some(permit) => Some(permit),
                None => {
                    warn!(step_id = target.step_id, "Step circuit breaker is open");
                    return StepExecution {
                        outcome: Err(CallError::circuit_open(&target.breaker_key())),
                        retry_count: 0,
                        duration_ms: timer.finish(),
                        analysis: None,
                    };
                }
            },
            None => None,
        };

        let mut retry_count = 0;
        loop {
            let attempt = retry_count + 1;
            let attempt_timer = SpanTimer::start(target.step_id);
            let token = cancel.child_token();

            let result = match policy.timeout_ms {
                Some(timeout_ms) => {
                    tokio::select! {
                        result = op(token.clone()) => Attempt::Done(result),
                        () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                            token.cancel(format!("step timed out after {timeout_ms}ms"));
                            Attempt::TimedOut(timeout_ms)
                        }
                    }
                }
                None => Attempt::Done(op(token).await),
            };
            let result = match result {
                Attempt::Done(result) => result,
                Attempt::TimedOut(ms) => Err(CallError::timeout(&format!("Step '{}'", target.step_id), ms)),
            };

            let error = match result {
                Ok(value) => {
                    if let Some(permit) = permit.as_mut() {
                        permit.succeed();
                    }
                    self.record_sample(target, attempt_timer.finish());
                    return StepExecution {
                        outcome: Ok(value),
                        retry_count,
                        duration_ms: timer.finish(),
                        analysis: None,
                    };
                }
                Err(error) => error,
            };

            if cancel.is_cancelled() {
                return StepExecution {
                    outcome: Err(CallError::cancelled(
                        cancel.reason().unwrap_or_else(|| "step cancelled".to_string()),
                    )),
                    retry_count,
                    duration_ms: timer.finish(),
                    analysis: None,
                };
            }

            let analysis = classify_failure(&error, attempt, policy);
            if analysis.is_retryable && retry_count < policy.max_retries {
                retry_count += 1;
                let delay = policy.backoff.delay_for_attempt(retry_count);
                debug!(
                    step_id = target.step_id,
                    attempt,
                    category = ?analysis.category,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error.message,
                    "Retrying step"
                );
                if !cancel.sleep(delay).await {
                    return StepExecution {
                        outcome: Err(CallError::cancelled(
                            cancel.reason().unwrap_or_else(|| "step cancelled".to_string()),
                        )),
                        retry_count,
                        duration_ms: timer.finish(),
                        analysis: Some(analysis),
                    };
                }
                continue;
            }

            if let Some(permit) = permit.as_mut() {
                permit.fail();
            }
            warn!(
                step_id = target.step_id,
                attempts = attempt,
                category = ?analysis.category,
                action = ?analysis.suggested_action,
                error = %error.message,
                "Step failed"
            );
            return StepExecution {
                outcome: Err(error),
                retry_count,
                duration_ms: timer.finish(),
                analysis: Some(analysis),
            };
        }
    }

    fn record_sample(&self, target: StepTarget<'_>, duration_ms: u64) {
        let usage = self.metrics.sample();
        let mut factors = Vec::new();
        if duration_ms > self.config.long_running_ms {
            factors.push("duration".to_string());
        }
        if usage.memory_mb > self.config.high_memory_mb {
            factors.push("memory".to_string());
        }
        if usage.cpu_percent > self.config.high_cpu_percent {
            factors.push("cpu".to_string());
        }
        if target.has_dependencies {
            factors.push("dependency".to_string());
        }

        self.samples
            .entry(target.execution_id.to_string())
            .or_default()
            .push(PerformanceSample {
                step_id: target.step_id.to_string(),
                duration_ms,
                resource_usage: usage,
                bottleneck_factors: factors,
                timestamp: Utc::now(),
            });
    }

    /// Builds the performance report for an execution.
    #[must_use]
    pub fn generate_performance_profile(&self, execution_id: &str) -> PerformanceProfile {
        let samples = self
            .samples
            .get(execution_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        if samples.is_empty() {
            return PerformanceProfile::default();
        }

        let total_duration_ms: u64 = samples.iter().map(|s| s.duration_ms).sum();
        let average_duration_ms = total_duration_ms as f64 / samples.len() as f64;
        let threshold = average_duration_ms * self.config.bottleneck_multiplier;

        let bottlenecks: Vec<Bottleneck> = samples
            .iter()
            .filter(|s| s.duration_ms as f64 > threshold)
            .map(|s| Bottleneck {
                step_id: s.step_id.clone(),
                duration_ms: s.duration_ms,
                factors: s.bottleneck_factors.clone(),
            })
            .collect();

        let high_resource_steps: Vec<String> = samples
            .iter()
            .filter(|s| {
                s.resource_usage.memory_mb > self.config.high_memory_mb
                    || s.resource_usage.cpu_percent > self.config.high_cpu_percent
            })
            .map(|s| s.step_id.clone())
            .collect();

        let mut suggestions = Vec::new();
        let independent: Vec<String> = samples
            .iter()
            .filter(|s| !s.bottleneck_factors.iter().any(|f| f == "dependency"))
            .map(|s| s.step_id.clone())
            .collect();
        if independent.len() > 1 {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::Parallelization,
                description: format!("{} steps have no dependencies and could run concurrently", independent.len()),
                step_ids: independent,
            });
        }
        if !high_resource_steps.is_empty() {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::ResourceOptimization,
                step_ids: high_resource_steps.clone(),
                description: "Reduce memory or CPU use of these steps".to_string(),
            });
        }
        let long_running: Vec<String> = samples
            .iter()
            .filter(|s| s.duration_ms > self.config.long_running_ms || s.duration_ms as f64 > threshold)
            .map(|s| s.step_id.clone())
            .collect();
        if !long_running.is_empty() {
            suggestions.push(OptimizationSuggestion {
                kind: SuggestionKind::LongRunning,
                step_ids: long_running,
                description: "Consider caching or splitting these long-running steps".to_string(),
            });
        }

        info!(
            execution_id,
            steps = samples.len(),
            total_duration_ms,
            bottlenecks = bottlenecks.len(),
            "Performance profile generated"
        );

        PerformanceProfile {
            total_duration_ms,
            step_count: samples.len(),
            average_duration_ms,
            bottlenecks,
            high_resource_steps,
            suggestions,
            samples,
        }
    }

    /// Drops the samples and step breakers of a finished execution.
    pub fn clear_execution(&self, execution_id: &str) {
        self.samples.remove(execution_id);
        self.breakers.remove_prefix(&format!("{execution_id}:"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::testing::StaticMetricsProvider;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn target(step_id: &str) -> StepTarget<'_> {
        StepTarget {
            execution_id: "exec-1",
            step_id,
            has_dependencies: false,
        }
    }

    fn fast_policy(max_retries: u32) -> EnhancedRetryPolicy {
        EnhancedRetryPolicy::new()
            .with_max_retries(max_retries)
            .with_backoff(BackoffPolicy::exponential(100, 1000))
    }

    #[test]
    fn test_policy_defaults() {
        let policy = EnhancedRetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.base_delay_ms, 1000);
        assert_eq!(policy.backoff.max_delay_ms, 30_000);
        let breaker = policy.circuit_breaker.unwrap();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout_ms, 60_000);

        let parsed: EnhancedRetryPolicy =
            serde_json::from_value(serde_json::json!({"circuitBreaker": null})).unwrap();
        assert!(parsed.circuit_breaker.is_none());
    }

    #[test]
    fn test_classification_rules() {
        let policy = EnhancedRetryPolicy::default();
        let classify = |msg: &str, attempt| classify_failure(&CallError::execution(msg), attempt, &policy);

        let a = classify("connection reset by peer", 1);
        assert_eq!((a.category, a.is_retryable), (FailureCategory::Transient, true));

        let a = classify("request timed out", 1);
        assert_eq!((a.category, a.suggested_action), (FailureCategory::Timeout, SuggestedAction::Retry));

        assert!(classify("out of memory", 2).is_retryable);
        let a = classify("out of memory", 3);
        assert_eq!((a.category, a.is_retryable), (FailureCategory::Resource, false));

        let a = classify("permission denied", 1);
        assert_eq!((a.category, a.suggested_action), (FailureCategory::Critical, SuggestedAction::Abort));

        let a = classify("record not found", 1);
        assert_eq!((a.category, a.suggested_action), (FailureCategory::Persistent, SuggestedAction::Skip));

        let a = classify("something odd", 1);
        assert!(a.is_retryable);
        assert!((a.confidence - 0.5).abs() < f64::EPSILON);

        let a = classify_failure(&CallError::timeout("x", 5), 1, &policy);
        assert_eq!(a.category, FailureCategory::Timeout);
    }

    #[test]
    fn test_policy_patterns_take_precedence() {
        let policy = EnhancedRetryPolicy::default()
            .with_retryable_error("quota.*exceeded")
            .with_critical_error("^fatal");

        let a = classify_failure(&CallError::execution("Quota was exceeded"), 1, &policy);
        assert_eq!(a.category, FailureCategory::Transient);
        assert!(a.is_retryable);

        let a = classify_failure(&CallError::execution("fatal: network down"), 1, &policy);
        assert_eq!(a.category, FailureCategory::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_with_backoff() {
        let intelligence = PipelineIntelligence::default();
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let run = intelligence
            .execute_step(target("s"), &fast_policy(3), &CancellationToken::new(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CallError::execution("network unreachable"))
                    } else {
                        Ok(serde_json::json!("ok"))
                    }
                }
            })
            .await;

        assert_eq!(run.outcome, Ok(serde_json::json!("ok")));
        assert_eq!(run.retry_count, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
        assert_eq!(intelligence.generate_performance_profile("exec-1").step_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_immediately() {
        let intelligence = PipelineIntelligence::default();
        let calls = AtomicU32::new(0);

        let run = intelligence
            .execute_step(target("s"), &fast_policy(3), &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::execution("permission denied")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.retry_count, 0);
        let analysis = run.analysis.unwrap();
        assert_eq!(analysis.suggested_action, SuggestedAction::Abort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_attempt_token() {
        let intelligence = PipelineIntelligence::default();
        let seen: Mutex<Vec<CancellationToken>> = Mutex::new(Vec::new());
        let policy = fast_policy(0).with_timeout_ms(50);

        let run = intelligence
            .execute_step(target("slow"), &policy, &CancellationToken::new(), |token| {
                seen.lock().push(token.clone());
                async move {
                    token.cancelled().await;
                    Ok(serde_json::json!("unreachable"))
                }
            })
            .await;

        let error = run.outcome.unwrap_err();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert!(seen.lock()[0].is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_is_not_retried() {
        let intelligence = PipelineIntelligence::default();
        let cancel = CancellationToken::new();
        cancel.cancel("user abort");

        let run = intelligence
            .execute_step(target("s"), &fast_policy(3), &cancel, |token| async move {
                Err(CallError::cancelled(token.reason().unwrap_or_default()))
            })
            .await;

        let error = run.outcome.unwrap_err();
        assert_eq!(error.code, ErrorCode::Cancelled);
        assert_eq!(error.message, "user abort");
        assert_eq!(run.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_breaker_rejects_when_open() {
        let intelligence = PipelineIntelligence::default();
        let policy = fast_policy(0).with_circuit_breaker(Some(CircuitBreakerConfig::new(
            1,
            Duration::from_secs(60),
        )));

        let first = intelligence
            .execute_step(target("s"), &policy, &CancellationToken::new(), |_| async {
                Err(CallError::execution("invalid payload"))
            })
            .await;
        assert!(first.outcome.is_err());

        let calls = AtomicU32::new(0);
        let second = intelligence
            .execute_step(target("s"), &policy, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(serde_json::Value::Null) }
            })
            .await;
        assert_eq!(second.outcome.unwrap_err().code, ErrorCode::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        intelligence.clear_execution("exec-1");
        assert!(intelligence.step_breaker("exec-1", "s").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_trial_keeps_breaker_usable() {
        let intelligence = PipelineIntelligence::default();
        let policy = fast_policy(0).with_circuit_breaker(Some(CircuitBreakerConfig::new(
            1,
            Duration::from_millis(100),
        )));

        let first = intelligence
            .execute_step(target("s"), &policy, &CancellationToken::new(), |_| async {
                Err(CallError::execution("invalid payload"))
            })
            .await;
        assert!(first.outcome.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");
        let trial = intelligence
            .execute_step(target("s"), &policy, &cancel, |token| async move {
                Err(CallError::cancelled(token.reason().unwrap_or_default()))
            })
            .await;
        assert_eq!(trial.outcome.unwrap_err().code, ErrorCode::Cancelled);
        let breaker = intelligence.step_breaker("exec-1", "s").unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().half_open_attempts, 0);

        let retry = intelligence
            .execute_step(target("s"), &policy, &CancellationToken::new(), |_| async {
                Ok(serde_json::json!("ok"))
            })
            .await;
        assert_eq!(retry.outcome, Ok(serde_json::json!("ok")));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_performance_profile() {
        let intelligence = PipelineIntelligence::default()
            .with_metrics_provider(Arc::new(StaticMetricsProvider::new(900.0, 10.0)));

        for (step, ms, deps) in [("a", 10, false), ("b", 10, false), ("c", 10, true), ("d", 100, true)] {
            intelligence.record_sample(
                StepTarget {
                    execution_id: "e",
                    step_id: step,
                    has_dependencies: deps,
                },
                ms,
            );
        }

        let profile = intelligence.generate_performance_profile("e");
        assert_eq!(profile.total_duration_ms, 130);
        assert_eq!(profile.step_count, 4);
        assert_eq!(profile.bottlenecks.len(), 1);
        assert_eq!(profile.bottlenecks[0].step_id, "d");
        assert_eq!(profile.high_resource_steps.len(), 4);

        let kinds: Vec<_> = profile.suggestions.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SuggestionKind::Parallelization,
                SuggestionKind::ResourceOptimization,
                SuggestionKind::LongRunning
            ]
        );
        assert_eq!(profile.suggestions[0].step_ids, vec!["a", "b"]);
        assert_eq!(intelligence.generate_performance_profile("other"), PerformanceProfile::default());
    }
}
