//! Pipeline execution.
//!
//! [`PipelineExecutor`] walks a [`PipelineDefinition`] in declared order:
//! dependencies are checked, inputs resolved, each step runs through
//! [`PipelineIntelligence`], and outputs are merged back into the context.
//!
//! # State machine
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED | PAUSED
//! PAUSED  -> RUNNING (resume) | CANCELLED
//! ```

use super::context::{PipelineContext, PipelineStepResult};
use super::definition::{
    AgentCall, ErrorStrategy, PipelineDefinition, PipelineStepDefinition, StepKind,
};
use super::expression::Expression;
use super::intelligence::{
    EnhancedRetryPolicy, PerformanceProfile, PipelineIntelligence, StepTarget,
};
use super::resolve::{extract_outputs, resolve_inputs};
use super::transform;
use crate::cancellation::CancellationToken;
use crate::collaborators::{AgentService, ChainExecutor};
use crate::errors::{CallError, ErrorCode};
use crate::events::{ContextSink, NoOpContextSink};
use crate::observability::SpanTimer;
use crate::registry::ServiceRegistry;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Not started.
    #[default]
    Pending,
    /// Steps are running.
    Running,
    /// All steps ran without an unrecovered failure.
    Completed,
    /// An unrecovered step failure stopped the run.
    Failed,
    /// The run was cancelled.
    Cancelled,
    /// The run stopped at a step boundary and can be resumed.
    Paused,
}

impl ExecutionStatus {
    /// Whether the run has ended for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Step results, final output and performance report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    /// Step results in recording order.
    pub steps: Vec<PipelineStepResult>,
    /// Result of the last successful step.
    pub output: Option<serde_json::Value>,
    /// Advisory performance report.
    pub performance_profile: PerformanceProfile,
}

/// Run-level counters and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run ended or paused.
    pub end_time: DateTime<Utc>,
    /// Wall-clock milliseconds.
    pub duration: u64,
    /// Top-level steps declared.
    pub total_steps: usize,
    /// Recorded successes.
    pub succeeded: usize,
    /// Recorded failures.
    pub failed: usize,
    /// Recorded skips.
    pub skipped: usize,
}

/// Outcome of [`PipelineExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Whether the run completed.
    pub success: bool,
    /// Final state.
    pub status: ExecutionStatus,
    /// Execution id.
    pub execution_id: String,
    /// Step results and output.
    pub result: PipelineOutput,
    /// The failure that ended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// Whether the fallback pipeline ran.
    #[serde(default)]
    pub fallback_used: bool,
    /// Counters and timing.
    pub metrics: PipelineMetrics,
}

impl PipelineResult {
    /// Returns a step's result.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&PipelineStepResult> {
        self.result.steps.iter().find(|r| r.step_id == step_id)
    }

    /// Number of steps that failed after running.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.result.steps.iter().filter(|r| r.failed()).count()
    }
}

/// A paused run.
#[derive(Debug)]
struct SavedRun {
    ctx: PipelineContext,
    next_index: usize,
    not_selected: HashSet<String>,
}

/// Executes one pipeline definition.
///
/// Methods take `&self`; share the executor behind an `Arc` to call
/// [`cancel`](Self::cancel) or [`pause`](Self::pause) while
/// [`execute`](Self::execute) runs.
pub struct PipelineExecutor {
    definition: Arc<PipelineDefinition>,
    registry: Arc<ServiceRegistry>,
    intelligence: Arc<PipelineIntelligence>,
    sink: Arc<dyn ContextSink>,
    chain_executor: Option<Arc<dyn ChainExecutor>>,
    agent_service: Option<Arc<dyn AgentService>>,
    team_service: Option<Arc<dyn AgentService>>,
    status: Mutex<ExecutionStatus>,
    cancel: RwLock<CancellationToken>,
    pause_requested: AtomicBool,
    saved: Mutex<Option<SavedRun>>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("pipeline_id", &self.definition.id)
            .field("steps", &self.definition.steps.len())
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Creates an executor dispatching tool steps through `registry`.
    #[must_use]
    pub fn new(definition: PipelineDefinition, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            definition: Arc::new(definition),
            registry,
            intelligence: Arc::new(PipelineIntelligence::default()),
            sink: Arc::new(NoOpContextSink),
            chain_executor: None,
            agent_service: None,
            team_service: None,
            status: Mutex::new(ExecutionStatus::Pending),
            cancel: RwLock::new(CancellationToken::new()),
            pause_requested: AtomicBool::new(false),
            saved: Mutex::new(None),
        }
    }

    /// Sets the intelligence layer.
    #[must_use]
    pub fn with_intelligence(mut self, intelligence: Arc<PipelineIntelligence>) -> Self {
        self.intelligence = intelligence;
        self
    }

    /// Sets the context sink.
    #[must_use]
    pub fn with_context_sink(mut self, sink: Arc<dyn ContextSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the chain executor used by `chain` steps.
    #[must_use]
    pub fn with_chain_executor(mut self, executor: Arc<dyn ChainExecutor>) -> Self {
        self.chain_executor = Some(executor);
        self
    }

    /// Sets the service used by `agent` steps.
    #[must_use]
    pub fn with_agent_service(mut self, service: Arc<dyn AgentService>) -> Self {
        self.agent_service = Some(service);
        self
    }

    /// Sets the service used by `team` steps.
    #[must_use]
    pub fn with_team_service(mut self, service: Arc<dyn AgentService>) -> Self {
        self.team_service = Some(service);
        self
    }

    /// Returns the definition.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Returns the current state.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        *self.status.lock()
    }

    /// Runs the pipeline with `input` seeded over the declared variables.
    pub async fn execute(&self, input: serde_json::Value) -> PipelineResult {
        self.execute_with_token(input, CancellationToken::new()).await
    }

    /// Runs the pipeline under an external cancellation token.
    pub async fn execute_with_token(
        &self,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let mut ctx = PipelineContext::new(&self.definition.id, self.definition.steps.len());
        ctx.seed(serde_json::Value::Object(self.definition.variables.clone()));
        ctx.seed(input);

        {
            let mut status = self.status.lock();
            if matches!(*status, ExecutionStatus::Running | ExecutionStatus::Paused) {
                drop(status);
                return self.rejected(ctx, "Pipeline execution already in progress");
            }
            *self.cancel.write() = cancel;
            *status = ExecutionStatus::Running;
        }
        self.pause_requested.store(false, Ordering::SeqCst);

        info!(
            pipeline_id = %self.definition.id,
            execution_id = %ctx.execution_id,
            steps = self.definition.steps.len(),
            "Pipeline execution started"
        );

        if let Err(e) = self.definition.validate() {
            warn!(pipeline_id = %self.definition.id, error = %e, "Pipeline definition rejected");
            return self.finish(ctx, ExecutionStatus::Failed, Some(CallError::from(e)), false);
        }

        self.run(ctx, 0, HashSet::new()).await
    }

    /// Continues a paused run from the step after the pause point.
    pub async fn resume(&self) -> PipelineResult {
        let saved = self.saved.lock().take();
        let Some(saved) = saved else {
            let ctx = PipelineContext::new(&self.definition.id, self.definition.steps.len());
            return self.rejected(ctx, "No paused execution to resume");
        };

        *self.status.lock() = ExecutionStatus::Running;
        self.pause_requested.store(false, Ordering::SeqCst);
        info!(
            execution_id = %saved.ctx.execution_id,
            next_step = saved.next_index,
            "Pipeline execution resumed"
        );
        self.run(saved.ctx, saved.next_index, saved.not_selected).await
    }

    /// Requests a pause at the next step boundary.
    ///
    /// Returns false when nothing is running.
    pub fn pause(&self) -> bool {
        if self.status() != ExecutionStatus::Running {
            return false;
        }
        self.pause_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Cancels the run, aborting an in-flight step.
    ///
    /// A paused run is finished as cancelled and cannot be resumed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.cancel.read().cancel(reason.clone());

        let saved = self.saved.lock().take();
        if let Some(saved) = saved {
            info!(execution_id = %saved.ctx.execution_id, %reason, "Paused pipeline cancelled");
            self.finish(
                saved.ctx,
                ExecutionStatus::Cancelled,
                Some(CallError::cancelled(reason)),
                false,
            );
        }
    }

    fn run(
        &self,
        mut ctx: PipelineContext,
        start: usize,
        mut not_selected: HashSet<String>,
    ) -> BoxFuture<'_, PipelineResult> {
        async move {
            let token = self.cancel.read().clone();
            let steps = &self.definition.steps;

            for (index, step) in steps.iter().enumerate().skip(start) {
                if token.is_cancelled() {
                    let error = cancelled_error(&token);
                    return self.finish(ctx, ExecutionStatus::Cancelled, Some(error), false);
                }
                if self.pause_requested.swap(false, Ordering::SeqCst) {
                    return self.park(ctx, index, not_selected);
                }
                ctx.metadata.current_step = index;

                if not_selected.contains(&step.id) {
                    debug!(step_id = %step.id, "Step not selected by condition");
                    ctx.record(PipelineStepResult::skipped(&step.id, "Not selected by condition"));
                    continue;
                }
                if let Some(reason) = unmet_dependency(step, &ctx) {
                    debug!(step_id = %step.id, %reason, "Skipping step");
                    ctx.record(PipelineStepResult::skipped(&step.id, reason));
                    continue;
                }

                let result = match &step.kind {
                    StepKind::Parallel { parallel } => {
                        let (result, subs) = self.run_parallel(step, &parallel.steps, &ctx, &token).await;
                        for sub in subs {
                            self.notify(&ctx, &sub);
                            ctx.record(sub);
                        }
                        result
                    }
                    _ => self.run_step(step, &ctx, &token).await,
                };

                if let (StepKind::Condition { condition }, true) = (&step.kind, result.success) {
                    let held = result
                        .result
                        .as_ref()
                        .and_then(|r| r.get("result"))
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false);
                    let other = if held { &condition.on_false } else { &condition.on_true };
                    if let Some(other) = other {
                        not_selected.insert(other.clone());
                    }
                }

                self.notify(&ctx, &result);
                let failure = result.failed().then(|| result.error.clone()).flatten();
                ctx.record(result);

                let Some(error) = failure else { continue };
                if token.is_cancelled() {
                    return self.finish(ctx, ExecutionStatus::Cancelled, Some(cancelled_error(&token)), false);
                }
                if step.continue_on_error {
                    debug!(step_id = %step.id, "Step failure isolated by continueOnError");
                    continue;
                }
                match self.definition.error_handling.strategy {
                    ErrorStrategy::Continue => {}
                    ErrorStrategy::Stop => {
                        return self.finish(ctx, ExecutionStatus::Failed, Some(error), false);
                    }
                    ErrorStrategy::Fallback => return self.run_fallback(ctx, error, &token).await,
                }
            }

            self.finish(ctx, ExecutionStatus::Completed, None, false)
        }
        .boxed()
    }

    async fn run_fallback(
        &self,
        ctx: PipelineContext,
        error: CallError,
        token: &CancellationToken,
    ) -> PipelineResult {
        let Some(fallback) = self.definition.error_handling.fallback_pipeline.as_deref() else {
            return self.finish(ctx, ExecutionStatus::Failed, Some(error), false);
        };

        warn!(
            pipeline_id = %self.definition.id,
            fallback_id = %fallback.id,
            error = %error.message,
            "Running fallback pipeline"
        );
        let executor = Self {
            definition: Arc::new(fallback.clone()),
            registry: Arc::clone(&self.registry),
            intelligence: Arc::clone(&self.intelligence),
            sink: Arc::clone(&self.sink),
            chain_executor: self.chain_executor.clone(),
            agent_service: self.agent_service.clone(),
            team_service: self.team_service.clone(),
            status: Mutex::new(ExecutionStatus::Pending),
            cancel: RwLock::new(CancellationToken::new()),
            pause_requested: AtomicBool::new(false),
            saved: Mutex::new(None),
        };
        let nested = executor
            .execute_with_token(serde_json::Value::Object(ctx.variables.clone()), token.child_token())
            .await;

        let mut ctx = ctx;
        for step in nested.result.steps {
            ctx.record(step);
        }
        if nested.success {
            let mut result = self.finish(ctx, ExecutionStatus::Completed, None, true);
            result.result.output = nested.result.output;
            result
        } else {
            let status = if nested.status == ExecutionStatus::Cancelled {
                ExecutionStatus::Cancelled
            } else {
                ExecutionStatus::Failed
            };
            self.finish(ctx, status, nested.error.or(Some(error)), true)
        }
    }

    fn policy_for(&self, step: &PipelineStepDefinition) -> EnhancedRetryPolicy {
        let mut policy = step
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.intelligence.default_policy().clone());
        if step.timeout_ms.is_some() {
            policy.timeout_ms = step.timeout_ms;
        }
        policy
    }

    async fn run_step(
        &self,
        step: &PipelineStepDefinition,
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> PipelineStepResult {
        let timer = SpanTimer::start(&step.id);
        let inputs = resolve_inputs(step, ctx);
        let policy = self.policy_for(step);
        let target = StepTarget {
            execution_id: &ctx.execution_id,
            step_id: &step.id,
            has_dependencies: !step.dependencies.is_empty(),
        };
        debug!(step_id = %step.id, kind = step.kind.name(), "Running step");

        let inputs = &inputs;
        let run = self
            .intelligence
            .execute_step(target, &policy, token, move |attempt| {
                self.dispatch_step(step, inputs, ctx, attempt)
            })
            .await;

        let (success, result, outputs, error) = match run.outcome {
            Ok(value) => {
                let outputs = extract_outputs(step, &value);
                (true, Some(value), outputs, None)
            }
            Err(e) => (false, None, HashMap::new(), Some(e)),
        };

        PipelineStepResult {
            step_id: step.id.clone(),
            success,
            skipped: false,
            result,
            outputs,
            error,
            start_time: timer.started_at(),
            end_time: Utc::now(),
            duration_ms: run.duration_ms,
            retry_count: run.retry_count,
            failure_analysis: run.analysis,
        }
    }

    async fn run_parallel(
        &self,
        step: &PipelineStepDefinition,
        subs: &[PipelineStepDefinition],
        ctx: &PipelineContext,
        token: &CancellationToken,
    ) -> (PipelineStepResult, Vec<PipelineStepResult>) {
        let timer = SpanTimer::start(&step.id);
        let limit = self.definition.concurrency.max_parallel.max(1);
        debug!(step_id = %step.id, sub_steps = subs.len(), limit, "Fanning out");

        let futures: Vec<_> = subs
            .iter()
            .enumerate()
            .map(move |(i, sub)| async move {
                let result = match unmet_dependency(sub, ctx) {
                    Some(reason) => PipelineStepResult::skipped(&sub.id, reason),
                    None => self.run_step(sub, ctx, token).await,
                };
                (i, result)
            })
            .collect();
        let mut results: Vec<(usize, PipelineStepResult)> = stream::iter(futures)
            .buffer_unordered(limit)
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        let results: Vec<PipelineStepResult> = results.into_iter().map(|(_, r)| r).collect();

        let combined: serde_json::Map<String, serde_json::Value> = results
            .iter()
            .map(|r| (r.step_id.clone(), r.result.clone().unwrap_or(serde_json::Value::Null)))
            .collect();
        let blocking = subs.iter().zip(&results).find(|(sub, r)| r.failed() && !sub.continue_on_error);

        let (success, result, outputs, error) = match blocking {
            None => {
                let value = serde_json::Value::Object(combined);
                let outputs = extract_outputs(step, &value);
                (true, Some(value), Some(outputs), None)
            }
            Some((sub, r)) => {
                let cause = r.error.as_ref().map_or("unknown error", |e| e.message.as_str());
                let error = CallError::execution(format!(
                    "Parallel step '{}' failed: sub-step '{}' failed: {cause}",
                    step.id, sub.id
                ))
                .with_detail("subStep", serde_json::json!(sub.id));
                (false, Some(serde_json::Value::Object(combined)), None, Some(error))
            }
        };

        let parent = PipelineStepResult {
            step_id: step.id.clone(),
            success,
            skipped: false,
            result,
            outputs: outputs.unwrap_or_default(),
            error,
            start_time: timer.started_at(),
            end_time: Utc::now(),
            duration_ms: timer.finish(),
            retry_count: 0,
            failure_analysis: None,
        };
        (parent, results)
    }

    async fn dispatch_step(
        &self,
        step: &PipelineStepDefinition,
        inputs: &serde_json::Map<String, serde_json::Value>,
        ctx: &PipelineContext,
        token: CancellationToken,
    ) -> Result<serde_json::Value, CallError> {
        match &step.kind {
            StepKind::Tool { tool } => self
                .registry
                .execute_call_with_token(
                    &tool.service_id,
                    &tool.method,
                    serde_json::Value::Object(inputs.clone()),
                    &token,
                )
                .await
                .into_result(),
            StepKind::Chain { chain } => {
                let executor = self
                    .chain_executor
                    .as_ref()
                    .ok_or_else(|| CallError::new(ErrorCode::ChainExecutionFailed, "No chain executor configured"))?;
                let run = executor.execute_chain(chain.clone(), serde_json::Value::Object(inputs.clone()));
                tokio::select! {
                    result = run => result.map_err(|e| {
                        CallError::new(ErrorCode::ChainExecutionFailed, format!("Chain execution failed: {e}"))
                            .with_detail("stepId", serde_json::json!(step.id))
                    }),
                    () = token.cancelled() => Err(cancelled_error(&token)),
                }
            }
            StepKind::Agent { agent } => {
                self.delegate("agent", self.agent_service.as_ref(), agent, inputs, &token)
                    .await
            }
            StepKind::Team { team } => {
                self.delegate("team", self.team_service.as_ref(), team, inputs, &token)
                    .await
            }
            StepKind::Condition { condition } => {
                let mut scope = ctx.variables.clone();
                scope.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                let held = Expression::parse(&condition.expression)
                    .and_then(|expr| expr.evaluate(&serde_json::Value::Object(scope)))
                    .map_err(|e| {
                        CallError::invalid_input(format!("Invalid condition expression: {e}"))
                            .with_detail("expression", serde_json::json!(condition.expression))
                    })?;
                let next = if held { &condition.on_true } else { &condition.on_false };
                Ok(serde_json::json!({"result": held, "next": next}))
            }
            StepKind::Transform { transform: call } => {
                let value = inputs
                    .get(&call.field)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                transform::apply(call.operation, &value)
            }
            StepKind::Wait { wait } => {
                if token.sleep(Duration::from_millis(wait.duration_ms)).await {
                    Ok(serde_json::json!({"waited": wait.duration_ms}))
                } else {
                    Err(cancelled_error(&token))
                }
            }
            StepKind::Parallel { .. } => Err(CallError::invalid_input(format!(
                "Parallel step '{}' cannot be nested",
                step.id
            ))),
        }
    }

    async fn delegate(
        &self,
        kind: &str,
        service: Option<&Arc<dyn AgentService>>,
        call: &AgentCall,
        inputs: &serde_json::Map<String, serde_json::Value>,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, CallError> {
        let service = service.ok_or_else(|| CallError::execution(format!("No {kind} service configured")))?;

        let existing = match &call.name {
            Some(name) => service.get(name.clone()).await,
            None => None,
        };
        let agent = match (existing, &call.config) {
            (Some(agent), _) => agent,
            (None, Some(config)) => service
                .create(config.clone())
                .await
                .map_err(|e| CallError::execution(format!("Failed to create {kind}: {e}")))?,
            (None, None) => {
                return Err(CallError::execution(format!(
                    "{kind} '{}' not found and no config given",
                    call.name.as_deref().unwrap_or_default()
                )))
            }
        };

        let task = ["task", "prompt", "query"]
            .iter()
            .find_map(|key| inputs.get(*key))
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .ok_or_else(|| CallError::invalid_input(format!("{kind} step requires a task, prompt or query input")))?;

        let outcome = tokio::select! {
            outcome = agent.run(task) => outcome,
            () = token.cancelled() => return Err(cancelled_error(token)),
        };
        if outcome.success {
            Ok(outcome.result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(CallError::execution(
                outcome.error.unwrap_or_else(|| format!("{kind} run failed")),
            ))
        }
    }

    fn notify(&self, ctx: &PipelineContext, result: &PipelineStepResult) {
        let scope = format!("{}:{}", ctx.execution_id, result.step_id);
        let data = serde_json::json!({
            "pipelineId": ctx.pipeline_id,
            "stepId": result.step_id,
            "success": result.success,
            "skipped": result.skipped,
            "duration": result.duration_ms,
            "retryCount": result.retry_count,
        });
        match (&result.error, result.skipped) {
            (Some(error), false) => self.sink.record_error_context(&scope, error, data),
            _ => self.sink.record_execution_context(&scope, data),
        }
    }

    fn park(&self, ctx: PipelineContext, next_index: usize, not_selected: HashSet<String>) -> PipelineResult {
        info!(execution_id = %ctx.execution_id, next_step = next_index, "Pipeline execution paused");
        let result = self.summarize(&ctx, ExecutionStatus::Paused, None, false);
        *self.saved.lock() = Some(SavedRun {
            ctx,
            next_index,
            not_selected,
        });
        *self.status.lock() = ExecutionStatus::Paused;
        result
    }

    fn rejected(&self, ctx: PipelineContext, message: &str) -> PipelineResult {
        warn!(pipeline_id = %self.definition.id, message, "Pipeline request rejected");
        let status = self.status();
        let mut result = self.summarize(&ctx, status, Some(CallError::invalid_input(message)), false);
        result.success = false;
        result
    }

    fn finish(
        &self,
        ctx: PipelineContext,
        status: ExecutionStatus,
        error: Option<CallError>,
        fallback_used: bool,
    ) -> PipelineResult {
        let result = self.summarize(&ctx, status, error, fallback_used);
        self.intelligence.clear_execution(&ctx.execution_id);
        *self.status.lock() = status;

        info!(
            pipeline_id = %ctx.pipeline_id,
            execution_id = %ctx.execution_id,
            status = ?status,
            duration_ms = result.metrics.duration,
            failed = result.metrics.failed,
            fallback_used,
            "Pipeline execution finished"
        );
        let data = serde_json::json!({
            "pipelineId": ctx.pipeline_id,
            "status": status,
            "duration": result.metrics.duration,
            "fallbackUsed": fallback_used,
        });
        match &result.error {
            Some(error) => self.sink.record_error_context(&ctx.execution_id, error, data),
            None => self.sink.record_execution_context(&ctx.execution_id, data),
        }
        result
    }

    fn summarize(
        &self,
        ctx: &PipelineContext,
        status: ExecutionStatus,
        error: Option<CallError>,
        fallback_used: bool,
    ) -> PipelineResult {
        let steps = ctx.ordered_results();
        let output = steps
            .iter()
            .rev()
            .find(|r| r.success)
            .and_then(|r| r.result.clone());
        let end_time = Utc::now();
        let duration = u64::try_from((end_time - ctx.started_at).num_milliseconds()).unwrap_or(0);

        let metrics = PipelineMetrics {
            start_time: ctx.started_at,
            end_time,
            duration,
            total_steps: ctx.metadata.total_steps,
            succeeded: steps.iter().filter(|r| r.success).count(),
            failed: steps.iter().filter(|r| r.failed()).count(),
            skipped: steps.iter().filter(|r| r.skipped).count(),
        };

        PipelineResult {
            success: status == ExecutionStatus::Completed,
            status,
            execution_id: ctx.execution_id.clone(),
            result: PipelineOutput {
                steps,
                output,
                performance_profile: self.intelligence.generate_performance_profile(&ctx.execution_id),
            },
            error,
            fallback_used,
            metrics,
        }
    }
}

fn unmet_dependency(step: &PipelineStepDefinition, ctx: &PipelineContext) -> Option<String> {
    step.dependencies
        .iter()
        .find(|d| !ctx.succeeded(d))
        .map(|d| format!("Dependency '{d}' did not complete successfully"))
}

fn cancelled_error(token: &CancellationToken) -> CallError {
    CallError::cancelled(token.reason().unwrap_or_else(|| "pipeline cancelled".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Agent, MockAgent, MockAgentService, MockChainExecutor, RunOutcome};
    use crate::events::{CollectingContextSink, ContextEventKind};
    use crate::pipeline::intelligence::IntelligenceConfig;
    use crate::pipeline::transform::TransformOp;
    use crate::testing::echo_registry;
    use pretty_assertions::assert_eq;

    fn no_retry() -> Arc<PipelineIntelligence> {
        Arc::new(PipelineIntelligence::new(IntelligenceConfig {
            default_policy: EnhancedRetryPolicy::new().with_max_retries(0),
            ..IntelligenceConfig::default()
        }))
    }

    async fn wait_until_running(executor: &PipelineExecutor) {
        while executor.status() != ExecutionStatus::Running {
            tokio::task::yield_now().await;
        }
    }

    fn executor(def: PipelineDefinition) -> PipelineExecutor {
        PipelineExecutor::new(def, echo_registry().unwrap()).with_intelligence(no_retry())
    }

    #[tokio::test]
    async fn test_tool_steps_thread_outputs() {
        let def = PipelineDefinition::new("p")
            .with_variable("topic", serde_json::json!("rust"))
            .with_step(
                PipelineStepDefinition::tool("first", "echo", "echo")
                    .with_input("q", serde_json::json!("$topic"))
                    .with_output("query", "q"),
            )
            .with_step(
                PipelineStepDefinition::tool("second", "echo", "echo")
                    .with_input("again", serde_json::json!("$query"))
                    .with_input("raw", serde_json::json!("@first.q"))
                    .with_dependency("first"),
            );

        let result = executor(def).execute(serde_json::Value::Null).await;

        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.result.output, Some(serde_json::json!({"again": "rust", "raw": "rust"})));
        assert_eq!(result.metrics.succeeded, 2);
    }

    #[tokio::test]
    async fn test_condition_skips_unselected_branch() {
        let def = PipelineDefinition::new("p")
            .with_step(
                PipelineStepDefinition::condition("check", "score >= 10 && !blocked", Some("high"), Some("low"))
                    .with_input("blocked", serde_json::json!(false)),
            )
            .with_step(PipelineStepDefinition::tool("high", "echo", "echo").with_input("v", serde_json::json!("high")))
            .with_step(PipelineStepDefinition::tool("low", "echo", "echo").with_input("v", serde_json::json!("low")));

        let result = executor(def).execute(serde_json::json!({"score": 12})).await;

        assert!(result.success);
        assert_eq!(
            result.step("check").unwrap().result,
            Some(serde_json::json!({"result": true, "next": "high"}))
        );
        assert!(result.step("high").unwrap().success);
        assert!(result.step("low").unwrap().skipped);
        assert_eq!(result.result.output, Some(serde_json::json!({"v": "high"})));
    }

    #[tokio::test]
    async fn test_transform_step() {
        let def = PipelineDefinition::new("p").with_step(
            PipelineStepDefinition::transform("up", TransformOp::Uppercase)
                .with_input("input", serde_json::json!("$name")),
        );
        let result = executor(def).execute(serde_json::json!({"name": "ada"})).await;
        assert_eq!(result.result.output, Some(serde_json::json!("ADA")));
    }

    #[tokio::test]
    async fn test_chain_failure_maps_to_chain_code() {
        let mut chain = MockChainExecutor::new();
        chain
            .expect_execute_chain()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("bad chain")));

        let def = PipelineDefinition::new("p").with_step(PipelineStepDefinition::new(
            "c",
            StepKind::Chain {
                chain: serde_json::json!({"steps": []}),
            },
        ));
        let result = executor(def)
            .with_chain_executor(Arc::new(chain))
            .execute(serde_json::Value::Null)
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::ChainExecutionFailed);
        assert!(error.message.contains("bad chain"));
    }

    #[tokio::test]
    async fn test_agent_step_falls_back_to_create() {
        let mut service = MockAgentService::new();
        service.expect_get().returning(|_| None);
        service.expect_create().times(1).returning(|_| {
            let mut agent = MockAgent::new();
            agent
                .expect_run()
                .withf(|task| task == "summarize rust")
                .returning(|task| RunOutcome::ok(serde_json::json!({"summary": task})));
            Ok(Arc::new(agent) as Arc<dyn Agent>)
        });

        let def = PipelineDefinition::new("p").with_step(
            PipelineStepDefinition::new(
                "a",
                StepKind::Agent {
                    agent: AgentCall {
                        name: Some("writer".into()),
                        config: Some(serde_json::json!({"role": "writer"})),
                    },
                },
            )
            .with_input("prompt", serde_json::json!("summarize rust")),
        );
        let result = executor(def)
            .with_agent_service(Arc::new(service))
            .execute(serde_json::Value::Null)
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result.output, Some(serde_json::json!({"summary": "summarize rust"})));
    }

    #[tokio::test]
    async fn test_team_step_requires_service() {
        let def = PipelineDefinition::new("p").with_step(
            PipelineStepDefinition::new("t", StepKind::Team { team: AgentCall::default() })
                .with_input("task", serde_json::json!("go")),
        );
        let result = executor(def).execute(serde_json::Value::Null).await;
        assert!(!result.success);
        assert!(result.error.unwrap().message.contains("No team service"));
    }

    #[tokio::test]
    async fn test_continue_strategy_and_dependency_skip() {
        let def = PipelineDefinition::new("p")
            .with_strategy(ErrorStrategy::Continue)
            .with_step(PipelineStepDefinition::tool("bad", "echo", "fail"))
            .with_step(PipelineStepDefinition::tool("needs_bad", "echo", "echo").with_dependency("bad"))
            .with_step(PipelineStepDefinition::tool("ok", "echo", "echo"));

        let result = executor(def).execute(serde_json::Value::Null).await;

        assert!(result.success);
        assert_eq!(result.failure_count(), 1);
        assert!(result.step("needs_bad").unwrap().skipped);
        assert!(result.step("ok").unwrap().success);
    }

    #[tokio::test]
    async fn test_fallback_without_pipeline_behaves_like_stop() {
        let mut def = PipelineDefinition::new("p")
            .with_step(PipelineStepDefinition::tool("bad", "echo", "fail"))
            .with_step(PipelineStepDefinition::tool("never", "echo", "echo"));
        def.error_handling.strategy = ErrorStrategy::Fallback;

        let result = executor(def).execute(serde_json::Value::Null).await;

        assert!(!result.success);
        assert!(!result.fallback_used);
        assert!(result.step("never").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let def = PipelineDefinition::new("p")
            .with_step(PipelineStepDefinition::wait("w", 100))
            .with_step(PipelineStepDefinition::tool("after", "echo", "echo").with_input("x", serde_json::json!(1)));
        let executor = Arc::new(executor(def));

        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move { runner.execute(serde_json::Value::Null).await });
        wait_until_running(&executor).await;
        assert!(executor.pause());

        let paused = handle.await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.result.steps.len(), 1);
        assert_eq!(executor.status(), ExecutionStatus::Paused);

        let resumed = executor.resume().await;
        assert!(resumed.success);
        assert_eq!(resumed.execution_id, paused.execution_id);
        assert_eq!(resumed.result.steps.len(), 2);

        let again = executor.resume().await;
        assert_eq!(again.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_wait() {
        let def = PipelineDefinition::new("p")
            .with_step(PipelineStepDefinition::wait("w", 60_000))
            .with_step(PipelineStepDefinition::tool("after", "echo", "echo"));
        let executor = Arc::new(executor(def));

        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move { runner.execute(serde_json::Value::Null).await });
        wait_until_running(&executor).await;
        executor.cancel("user stop");

        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.error.as_ref().unwrap().message, "user stop");
        assert!(result.step("after").is_none());
        assert_eq!(executor.status(), ExecutionStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_paused_run_discards_it() {
        let def = PipelineDefinition::new("p")
            .with_step(PipelineStepDefinition::wait("w", 10))
            .with_step(PipelineStepDefinition::wait("w2", 10));
        let intelligence = no_retry();
        let sink = Arc::new(CollectingContextSink::new());
        let executor = Arc::new(
            PipelineExecutor::new(def, echo_registry().unwrap())
                .with_intelligence(Arc::clone(&intelligence))
                .with_context_sink(sink.clone()),
        );
        assert!(!executor.pause());

        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move { runner.execute(serde_json::Value::Null).await });
        wait_until_running(&executor).await;
        executor.pause();
        let paused = handle.await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        let execution_id = paused.execution_id;
        assert_eq!(intelligence.generate_performance_profile(&execution_id).step_count, 1);

        executor.cancel("abandon");
        assert_eq!(executor.status(), ExecutionStatus::Cancelled);
        assert_eq!(intelligence.generate_performance_profile(&execution_id).step_count, 0);
        assert!(intelligence.step_breaker(&execution_id, "w").is_none());

        let terminal: Vec<_> = sink
            .events_of_kind(ContextEventKind::Error)
            .into_iter()
            .filter(|e| e.scope == execution_id)
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].error.as_ref().unwrap().code, ErrorCode::Cancelled);
        assert_eq!(terminal[0].data["status"], "CANCELLED");

        assert!(executor.resume().await.error.is_some());
    }
}
