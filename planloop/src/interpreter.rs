//! Sequential interpretation of a structured plan.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::binder::{BindRequest, ParameterBinder};
use crate::cancel::Cancelled;
use crate::core::bindings::BindingContext;
use crate::core::plan::{Plan, Step, validate_plan};
use crate::core::types::{ExecutionResult, StepExecutionResult};
use crate::events::{RunEvent, RunObserver, RunStreamItem, stream_run};
use crate::executor::{FunctionStepExecutor, StepExecutor, StepRequest, ToolStepExecutor};
use crate::io::config::EngineConfig;
use crate::io::registry::Registry;
use crate::resolver::{ExecutableItem, ExecutableResolver};

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Resolve, bind and execute one step. Shared by the interpreter and the
/// iteration strategies.
pub struct StepPipeline {
    resolver: ExecutableResolver,
    binder: ParameterBinder,
    tools: ToolStepExecutor,
    functions: FunctionStepExecutor,
}

impl StepPipeline {
    pub fn new(registry: Arc<dyn Registry>, config: &EngineConfig) -> Self {
        Self {
            resolver: ExecutableResolver::new(Arc::clone(&registry)),
            binder: ParameterBinder::new(registry, config.binding.rules()),
            tools: ToolStepExecutor,
            functions: FunctionStepExecutor::new(config.ambient_parameters.clone()),
        }
    }

    /// Every failure (unknown target, binding, execution) comes back as an
    /// unsuccessful result carrying the step's identity.
    #[instrument(skip_all, fields(step = step.step_number, target = %step.target_name))]
    pub async fn run_step(
        &self,
        step: &Step,
        goal: &str,
        bindings: &BindingContext,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, Cancelled> {
        let started = Instant::now();
        let Some(item) = self.resolver.resolve(&step.target_name) else {
            return Ok(
                StepExecutionResult::failure(step, format!("target not found: {}", step.target_name))
                    .with_elapsed_ms(elapsed_ms(started)),
            );
        };

        let bound = self
            .binder
            .process(
                BindRequest {
                    tool: item.as_tool(),
                    raw_parameters: step.raw_parameters.as_deref(),
                    goal,
                    step_description: &step.description,
                    bindings,
                },
                cancel,
            )
            .await?;
        if !bound.is_success {
            let error = bound
                .error_message
                .unwrap_or_else(|| "parameter binding failed".to_string());
            return Ok(StepExecutionResult::failure(step, error).with_elapsed_ms(elapsed_ms(started)));
        }

        let request = StepRequest {
            step,
            parameters: bound.parameters.as_deref(),
            goal,
            bindings,
        };
        let result = match &item {
            ExecutableItem::Tool(tool) => {
                self.tools
                    .execute(request, tool.as_ref(), observer, cancel)
                    .await?
            }
            ExecutableItem::ModelFunction(function) => {
                self.functions
                    .execute(request, function.as_ref(), observer, cancel)
                    .await?
            }
        };
        Ok(result
            .with_parameters(bound.parameters)
            .with_elapsed_ms(elapsed_ms(started)))
    }
}

/// Runs a plan's steps in order, failing fast on the first failed step.
pub struct PlanInterpreter {
    pipeline: Arc<StepPipeline>,
}

impl PlanInterpreter {
    pub fn new(registry: Arc<dyn Registry>, config: &EngineConfig) -> Self {
        Self {
            pipeline: Arc::new(StepPipeline::new(registry, config)),
        }
    }

    pub fn with_pipeline(pipeline: Arc<StepPipeline>) -> Self {
        Self { pipeline }
    }

    /// Execute `plan` against `bindings`, which receives every output
    /// variable bound along the way.
    ///
    /// A step's `output_variable` is bound to its output text (empty when
    /// the step produced none) only after the step succeeds.
    #[instrument(skip_all, fields(steps = plan.steps.len()))]
    pub async fn execute(
        &self,
        goal: &str,
        plan: &Plan,
        bindings: &mut BindingContext,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        let started = Instant::now();
        if !plan.is_executable {
            warn!(blocker = plan.blocker_text(), "plan is not executable");
            return Ok(ExecutionResult::failed(plan.blocker_text()));
        }
        let violations = validate_plan(plan);
        if !violations.is_empty() {
            warn!(?violations, "plan failed validation");
            return Ok(ExecutionResult::failed(format!(
                "invalid plan: {}",
                violations.join("; ")
            )));
        }

        let mut steps = Vec::with_capacity(plan.steps.len());
        for step in plan.ordered_steps() {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let result = self
                .pipeline
                .run_step(step, goal, bindings, observer, cancel)
                .await?;
            observer.on_event(RunEvent::StepCompleted(result.clone()));

            if !result.is_success {
                let error = format!("step {} failed: {}", step.step_number, result.error_text());
                warn!(%error, "plan stopped");
                steps.push(result);
                return Ok(ExecutionResult {
                    is_success: false,
                    steps,
                    error_message: Some(error),
                    summary: plan.summary.clone(),
                    total_execution_time_ms: elapsed_ms(started),
                });
            }
            if let Some(variable) = &step.output_variable {
                let text = result.output.clone().unwrap_or_default();
                bindings.set(variable.clone(), Value::String(text));
            }
            steps.push(result);
        }

        info!(steps = steps.len(), "plan completed");
        Ok(ExecutionResult {
            is_success: true,
            steps,
            error_message: None,
            summary: plan.summary.clone(),
            total_execution_time_ms: elapsed_ms(started),
        })
    }

    /// Same as [`Self::execute`], with progress delivered as stream items.
    pub fn execute_stream<'a>(
        &'a self,
        goal: &'a str,
        plan: &'a Plan,
        bindings: &'a mut BindingContext,
        cancel: &'a CancellationToken,
    ) -> BoxStream<'a, RunStreamItem<Result<ExecutionResult, Cancelled>>> {
        stream_run(move |mut observer| {
            async move { self.execute(goal, plan, bindings, &mut observer, cancel).await }.boxed()
        })
    }
}
