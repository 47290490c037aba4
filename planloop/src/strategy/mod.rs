//! Goal-driven iteration strategies.
//!
//! A strategy drives repeated model-guided action until the goal is reached,
//! the model gives up, or the iteration cap is hit. Every stop is reported as
//! a [`StrategyOutcome`]; only cancellation is an error.

use async_trait::async_trait;
use futures::FutureExt;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cancel::{self, Cancelled};
use crate::core::bindings::BindingContext;
use crate::core::types::{HistoryEntry, ReactRecord, StopReason, StrategyOutcome};
use crate::events::{NoopObserver, RunObserver, RunStreamItem, stream_run};
use crate::io::model::{FunctionOutput, FunctionRole, InvocationContext};
use crate::io::registry::Registry;

pub mod plan_execute;
pub mod react;

pub use plan_execute::PlanExecuteStrategy;
pub use react::ReactStrategy;

#[async_trait]
pub trait IterationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute_with(
        &self,
        goal: &str,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, Cancelled>;

    async fn execute(&self, goal: &str, cancel: &CancellationToken) -> Result<StrategyOutcome, Cancelled> {
        let mut observer = NoopObserver;
        self.execute_with(goal, &mut observer, cancel).await
    }
}

/// Run `strategy` as a stream of events ending in its outcome.
pub fn execute_stream<'a, S>(
    strategy: &'a S,
    goal: &'a str,
    cancel: &'a CancellationToken,
) -> BoxStream<'a, RunStreamItem<Result<StrategyOutcome, Cancelled>>>
where
    S: IterationStrategy + ?Sized,
{
    stream_run(move |mut observer| {
        async move { strategy.execute_with(goal, &mut observer, cancel).await }.boxed()
    })
}

/// Mutable state of one strategy run.
#[derive(Debug, Default)]
pub(crate) struct RunContext {
    pub goal: String,
    pub iterations: u32,
    pub is_complete: bool,
    pub bindings: BindingContext,
    pub shared: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
    pub records: Vec<ReactRecord>,
}

impl RunContext {
    pub fn new(goal: &str) -> Self {
        Self {
            goal: goal.to_string(),
            ..Self::default()
        }
    }

    pub fn finish(self, stop: StopReason, final_answer: Option<String>) -> StrategyOutcome {
        StrategyOutcome {
            is_success: !stop.is_error(),
            is_complete: self.is_complete,
            iterations: self.iterations,
            error_message: stop.error_message(),
            stop,
            final_answer,
            history: self.history,
            records: self.records,
            bindings: self.bindings.snapshot(),
            shared_data: Value::Object(self.shared),
        }
    }
}

/// Outcome of asking the registry's function for a role.
pub(crate) enum RoleCall {
    Missing,
    Failed(String),
    Done(FunctionOutput),
}

pub(crate) async fn call_role(
    registry: &dyn Registry,
    role: FunctionRole,
    context: &InvocationContext,
    cancel: &CancellationToken,
) -> Result<RoleCall, Cancelled> {
    let Some(function) = registry.model_function(role) else {
        return Ok(RoleCall::Missing);
    };
    match cancel::call(cancel, function.execute(context)).await? {
        Ok(output) if output.is_success => Ok(RoleCall::Done(output)),
        Ok(output) => Ok(RoleCall::Failed(
            output
                .error_message
                .unwrap_or_else(|| format!("{role} reported failure")),
        )),
        Err(err) => {
            warn!(%role, error = %format!("{err:#}"), "model function raised an error");
            Ok(RoleCall::Failed(format!("{err:#}")))
        }
    }
}

/// Pretty JSON for prompt material; empty for empty lists.
pub(crate) fn prompt_json<T: serde::Serialize>(items: &[T]) -> anyhow::Result<String> {
    if items.is_empty() {
        return Ok(String::new());
    }
    Ok(serde_json::to_string_pretty(items)?)
}

/// Fold a loop result into an outcome: cancellation propagates, anything
/// else unexpected becomes a failed stop.
pub(crate) fn settle(result: anyhow::Result<StopReason>) -> Result<StopReason, Cancelled> {
    match result {
        Ok(stop) => Ok(stop),
        Err(err) if cancel::is_cancellation(&err) => Err(Cancelled),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "strategy loop failed");
            Ok(StopReason::Failed {
                error: format!("{err:#}"),
            })
        }
    }
}
