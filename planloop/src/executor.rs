//! Invocation of one resolved step target.
//!
//! Each executor is paired with exactly one kind of target through
//! [`StepExecutor::Target`], so a tool can never reach the function executor
//! or the other way around.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cancel::{self, Cancelled, is_cancellation};
use crate::core::bindings::{BindingContext, render_value};
use crate::core::model_output::success_indicator;
use crate::core::plan::Step;
use crate::core::types::StepExecutionResult;
use crate::events::{RunEvent, RunObserver};
use crate::io::model::{FunctionOutput, InvocationContext, ModelFunction};
use crate::io::tool::Tool;

/// The step being executed with its bound parameters.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub step: &'a Step,
    pub parameters: Option<&'a str>,
    pub goal: &'a str,
    pub bindings: &'a BindingContext,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    type Target: ?Sized + Send + Sync;

    /// Failures come back as an unsuccessful result; only cancellation is
    /// an error.
    async fn execute(
        &self,
        request: StepRequest<'_>,
        target: &Self::Target,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, Cancelled>;
}

/// JSON when the parameters parse as JSON, the raw text otherwise, null when
/// absent.
pub fn tool_input(parameters: Option<&str>) -> Value {
    match parameters {
        None => Value::Null,
        Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ToolStepExecutor;

#[async_trait]
impl StepExecutor for ToolStepExecutor {
    type Target = dyn Tool;

    #[instrument(skip_all, fields(step = request.step.step_number, tool = target.name()))]
    async fn execute(
        &self,
        request: StepRequest<'_>,
        target: &Self::Target,
        _observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, Cancelled> {
        let input = tool_input(request.parameters);
        match cancel::call(cancel, target.execute(input)).await? {
            Ok(output) => Ok(StepExecutionResult {
                is_success: output.is_success,
                output: output.data.as_ref().map(render_value),
                error_message: output.error_message,
                ..StepExecutionResult::success(request.step, None)
            }),
            Err(err) => {
                debug!(error = %format!("{err:#}"), "tool raised an error");
                Ok(StepExecutionResult::failure(
                    request.step,
                    format!("tool {} failed: {err:#}", target.name()),
                ))
            }
        }
    }
}

/// Runs model functions, merging ambient parameters into every invocation.
#[derive(Debug, Default, Clone)]
pub struct FunctionStepExecutor {
    ambient: Map<String, Value>,
}

impl FunctionStepExecutor {
    pub fn new(ambient: Map<String, Value>) -> Self {
        Self { ambient }
    }

    /// Ambient parameters first, then the bound parameters on top. Bound
    /// parameters that are not a JSON object land under `input`.
    pub fn context_for(&self, request: &StepRequest<'_>) -> InvocationContext {
        let mut parameters = self.ambient.clone();
        match tool_input(request.parameters) {
            Value::Null => {}
            Value::Object(bound) => parameters.extend(bound),
            other => {
                parameters.insert("input".to_string(), other);
            }
        }
        let mut context = InvocationContext::new(request.goal);
        context.parameters = parameters;
        if !request.step.description.trim().is_empty() {
            context = context.with_auxiliary("step", request.step.description.clone());
        }
        context
    }

    async fn consume_stream(
        &self,
        request: &StepRequest<'_>,
        target: &dyn ModelFunction,
        context: &InvocationContext,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<FunctionOutput, Cancelled> {
        let mut stream = match cancel::call(cancel, target.execute_stream(context)).await? {
            Ok(stream) => stream,
            Err(err) => return Ok(FunctionOutput::failure(format!("{err:#}"))),
        };
        let mut raw = String::new();
        let mut parsed = None;
        while let Some(item) = cancel::guard(cancel, stream.next()).await? {
            match item {
                Ok(chunk) => {
                    if !chunk.text.is_empty() {
                        raw.push_str(&chunk.text);
                        observer.on_event(RunEvent::Chunk {
                            step_number: request.step.step_number,
                            text: chunk.text,
                        });
                    }
                    if chunk.is_final {
                        parsed = chunk.parsed;
                    }
                }
                Err(err) if is_cancellation(&err) => return Err(Cancelled),
                Err(err) => return Ok(FunctionOutput::failure(format!("stream failed: {err:#}"))),
            }
        }
        Ok(FunctionOutput {
            is_success: true,
            parsed,
            raw_response: Some(raw),
            error_message: None,
        })
    }
}

#[async_trait]
impl StepExecutor for FunctionStepExecutor {
    type Target = dyn ModelFunction;

    #[instrument(skip_all, fields(step = request.step.step_number, role = %target.role()))]
    async fn execute(
        &self,
        request: StepRequest<'_>,
        target: &Self::Target,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, Cancelled> {
        let context = self.context_for(&request);
        let output = if target.supports_streaming() && observer.wants_chunks() {
            self.consume_stream(&request, target, &context, observer, cancel)
                .await?
        } else {
            match cancel::call(cancel, target.execute(&context)).await? {
                Ok(output) => output,
                Err(err) => FunctionOutput::failure(format!("{} failed: {err:#}", target.role())),
            }
        };
        Ok(result_from_output(request.step, output))
    }
}

/// Map a function output onto a step result.
///
/// A structured result that carries its own success flag overrides the
/// invocation's generic flag.
pub fn result_from_output(step: &Step, output: FunctionOutput) -> StepExecutionResult {
    let text = match &output.parsed {
        Some(Value::String(text)) => Some(text.clone()),
        Some(parsed) => Some(parsed.to_string()),
        None => output.raw_response.clone(),
    };
    let (is_success, error_message) = match output.parsed.as_ref().and_then(success_indicator) {
        Some((flag, error)) => (flag, error.or(output.error_message)),
        None => (output.is_success, output.error_message),
    };
    StepExecutionResult {
        is_success,
        output: text,
        error_message,
        ..StepExecutionResult::success(step, None)
    }
}
