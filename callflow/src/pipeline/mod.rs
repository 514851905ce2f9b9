//! Pipeline definition and execution.
//!
//! This module provides:
//! - Serde-declarable pipeline and step definitions
//! - Per-execution context with input and output resolution
//! - A sandboxed condition-expression evaluator
//! - Step retry, breaker, timeout and performance analysis
//! - The pipeline executor

pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod intelligence;
pub mod resolve;
pub mod transform;

mod integration_tests;

pub use context::{ErrorRecord, PipelineContext, PipelineStepResult, RunMetadata};
pub use definition::{
    AgentCall, ConcurrencyConfig, ConditionCall, ErrorHandling, ErrorStrategy, InputFn,
    ParallelCall, PipelineDefinition, PipelineStepDefinition, StepKind, ToolCall, TransformCall,
    WaitCall,
};
pub use executor::{
    ExecutionStatus, PipelineExecutor, PipelineMetrics, PipelineOutput, PipelineResult,
};
pub use expression::Expression;
pub use intelligence::{
    classify_failure, Bottleneck, EnhancedRetryPolicy, FailureAnalysis, FailureCategory,
    IntelligenceConfig, MetricsProvider, OptimizationSuggestion, PerformanceProfile,
    PerformanceSample, PipelineIntelligence, Severity, StepExecution, StepTarget,
    SuggestedAction, SuggestionKind,
};
pub use transform::TransformOp;
