//! Pipeline and step definitions.
//!
//! Definitions deserialize from JSON. A step's `type` selects exactly one
//! payload field of the same name:
//!
//! ```json
//! {"id": "lookup", "type": "tool", "tool": {"serviceId": "search", "method": "query"},
//!  "inputs": {"q": "$topic"}, "outputs": {"hits": "results[0]"}}
//! ```

use super::context::PipelineContext;
use super::intelligence::EnhancedRetryPolicy;
use super::transform::TransformOp;
use crate::errors::DefinitionError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Computes a step's inputs from the live context, replacing declared inputs.
pub type InputFn = Arc<dyn Fn(&PipelineContext) -> serde_json::Value + Send + Sync>;

/// A registry call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Target service id.
    pub service_id: String,
    /// Method name.
    pub method: String,
}

/// An agent or team delegation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCall {
    /// Name of an existing agent or team.
    #[serde(default)]
    pub name: Option<String>,
    /// Configuration used to create one when `name` is absent or unknown.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// A branch on a boolean expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionCall {
    /// Expression evaluated against the step inputs over the context variables.
    pub expression: String,
    /// Step selected when the expression holds.
    #[serde(default)]
    pub on_true: Option<String>,
    /// Step selected otherwise.
    #[serde(default)]
    pub on_false: Option<String>,
}

fn default_transform_field() -> String {
    "input".to_string()
}

/// A value transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformCall {
    /// Operation to apply.
    pub operation: TransformOp,
    /// Which resolved input to transform.
    #[serde(default = "default_transform_field")]
    pub field: String,
}

/// A concurrent fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelCall {
    /// Sub-steps run concurrently.
    pub steps: Vec<PipelineStepDefinition>,
}

/// A timed pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitCall {
    /// How long to wait.
    #[serde(alias = "duration")]
    pub duration_ms: u64,
}

/// What a step does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Call a registered service method.
    Tool {
        /// Call target.
        tool: ToolCall,
    },
    /// Run a chain definition through the chain executor.
    Chain {
        /// Opaque chain definition.
        chain: serde_json::Value,
    },
    /// Delegate to an agent.
    Agent {
        /// Agent selection.
        agent: AgentCall,
    },
    /// Delegate to a team.
    Team {
        /// Team selection.
        team: AgentCall,
    },
    /// Evaluate an expression and select a successor.
    Condition {
        /// Branch definition.
        condition: ConditionCall,
    },
    /// Transform a value.
    Transform {
        /// Transformation.
        transform: TransformCall,
    },
    /// Run sub-steps concurrently.
    Parallel {
        /// Sub-steps.
        parallel: ParallelCall,
    },
    /// Pause.
    Wait {
        /// Duration.
        wait: WaitCall,
    },
}

impl StepKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::Chain { .. } => "chain",
            Self::Agent { .. } => "agent",
            Self::Team { .. } => "team",
            Self::Condition { .. } => "condition",
            Self::Transform { .. } => "transform",
            Self::Parallel { .. } => "parallel",
            Self::Wait { .. } => "wait",
        }
    }
}

/// One step of a pipeline.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepDefinition {
    /// Unique step id.
    pub id: String,
    /// Kind and payload.
    #[serde(flatten)]
    pub kind: StepKind,
    /// Declared inputs: `$var`, `@step` / `@step.path` references or literals.
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Context variable name to result path.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Steps that must complete successfully first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Overrides the default retry policy.
    #[serde(default)]
    pub retry_policy: Option<EnhancedRetryPolicy>,
    /// Overrides the policy timeout.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    /// Record a failure and keep going.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Replaces declared input resolution.
    #[serde(skip)]
    pub input_fn: Option<InputFn>,
}

impl fmt::Debug for PipelineStepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStepDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("dependencies", &self.dependencies)
            .field("retry_policy", &self.retry_policy)
            .field("timeout_ms", &self.timeout_ms)
            .field("continue_on_error", &self.continue_on_error)
            .field("input_fn", &self.input_fn.is_some())
            .finish()
    }
}

impl PipelineStepDefinition {
    /// Creates a step.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            inputs: serde_json::Map::new(),
            outputs: HashMap::new(),
            dependencies: Vec::new(),
            retry_policy: None,
            timeout_ms: None,
            continue_on_error: false,
            input_fn: None,
        }
    }

    /// Creates a tool step.
    #[must_use]
    pub fn tool(id: impl Into<String>, service_id: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Tool {
                tool: ToolCall {
                    service_id: service_id.into(),
                    method: method.into(),
                },
            },
        )
    }

    /// Creates a transform step over the `input` field.
    #[must_use]
    pub fn transform(id: impl Into<String>, operation: TransformOp) -> Self {
        Self::new(
            id,
            StepKind::Transform {
                transform: TransformCall {
                    operation,
                    field: default_transform_field(),
                },
            },
        )
    }

    /// Creates a condition step.
    #[must_use]
    pub fn condition(
        id: impl Into<String>,
        expression: impl Into<String>,
        on_true: Option<&str>,
        on_false: Option<&str>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                condition: ConditionCall {
                    expression: expression.into(),
                    on_true: on_true.map(str::to_string),
                    on_false: on_false.map(str::to_string),
                },
            },
        )
    }

    /// Creates a wait step.
    #[must_use]
    pub fn wait(id: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(id, StepKind::Wait { wait: WaitCall { duration_ms } })
    }

    /// Creates a parallel step.
    #[must_use]
    pub fn parallel(id: impl Into<String>, steps: Vec<Self>) -> Self {
        Self::new(id, StepKind::Parallel { parallel: ParallelCall { steps } })
    }

    /// Adds a declared input.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Maps a result path into a context variable.
    #[must_use]
    pub fn with_output(mut self, variable: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.insert(variable.into(), path.into());
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: EnhancedRetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Keeps the pipeline running when this step fails.
    #[must_use]
    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    /// Sets a dynamic input function.
    #[must_use]
    pub fn with_input_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&PipelineContext) -> serde_json::Value + Send + Sync + 'static,
    {
        self.input_fn = Some(Arc::new(f));
        self
    }
}

/// What happens when a step fails without `continueOnError`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Abort the execution.
    #[default]
    Stop,
    /// Record the failure and run the next step.
    Continue,
    /// Run the fallback pipeline, or stop if none is configured.
    Fallback,
}

/// Pipeline-level failure handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    /// Strategy.
    #[serde(default)]
    pub strategy: ErrorStrategy,
    /// Pipeline run for the `fallback` strategy.
    #[serde(default)]
    pub fallback_pipeline: Option<Box<PipelineDefinition>>,
}

fn default_max_parallel() -> usize {
    4
}

/// Concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Sub-steps of a parallel step in flight at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

/// A pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    /// Pipeline id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<PipelineStepDefinition>,
    /// Initial context variables.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Failure handling.
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Concurrency limits.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl PipelineDefinition {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps: Vec::new(),
            variables: serde_json::Map::new(),
            error_handling: ErrorHandling::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: PipelineStepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Seeds a variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Sets the error strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_handling.strategy = strategy;
        self
    }

    /// Sets the fallback pipeline and selects the `fallback` strategy.
    #[must_use]
    pub fn with_fallback(mut self, pipeline: Self) -> Self {
        self.error_handling.strategy = ErrorStrategy::Fallback;
        self.error_handling.fallback_pipeline = Some(Box::new(pipeline));
        self
    }

    /// Sets the parallel fan-out limit.
    #[must_use]
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.concurrency.max_parallel = max_parallel;
        self
    }

    /// Parses a definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] if the JSON does not describe a pipeline.
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(json)
            .map_err(|e| DefinitionError::new(format!("Invalid pipeline definition: {e}")))
    }

    /// Checks ids and dependencies.
    ///
    /// Top-level and parallel sub-step ids share one namespace. Every
    /// dependency must name a step of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] naming the offending steps.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::new("Pipeline id cannot be empty"));
        }

        let mut ids = HashSet::new();
        for step in self.all_steps() {
            if step.id.trim().is_empty() {
                return Err(DefinitionError::new("Step id cannot be empty"));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(DefinitionError::new(format!("Duplicate step id '{}'", step.id))
                    .with_steps(vec![step.id.clone()]));
            }
        }

        for step in self.all_steps() {
            if let Some(missing) = step.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
                return Err(DefinitionError::new(format!(
                    "Step '{}' depends on unknown step '{missing}'",
                    step.id
                ))
                .with_steps(vec![step.id.clone(), missing.clone()]));
            }
            if step.dependencies.contains(&step.id) {
                return Err(DefinitionError::new(format!(
                    "Step '{}' cannot depend on itself",
                    step.id
                ))
                .with_steps(vec![step.id.clone()]));
            }
        }

        if let Some(fallback) = &self.error_handling.fallback_pipeline {
            fallback.validate()?;
        }
        Ok(())
    }

    /// Iterates top-level steps and the sub-steps of parallel steps.
    pub fn all_steps(&self) -> impl Iterator<Item = &PipelineStepDefinition> {
        self.steps.iter().flat_map(|step| {
            let subs: &[PipelineStepDefinition] = match &step.kind {
                StepKind::Parallel { parallel } => &parallel.steps,
                _ => &[],
            };
            std::iter::once(step).chain(subs.iter())
        })
    }
}
