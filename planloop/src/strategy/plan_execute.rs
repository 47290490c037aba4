//! Plan, execute, evaluate.
//!
//! Each iteration asks the planner for a batch of actions, runs them in
//! order, then asks the completion checker whether the goal is met. Without
//! a checker, a count of successful actions stands in for the verdict.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancel::Cancelled;
use crate::core::heuristics::enough_successes;
use crate::core::model_output::{extract_actions, parse_completion};
use crate::core::types::{ActionKind, HistoryEntry, StopReason, StrategyOutcome};
use crate::events::{RunEvent, RunObserver};
use crate::interpreter::StepPipeline;
use crate::io::config::{EngineConfig, PlanExecuteConfig};
use crate::io::model::{FunctionRole, InvocationContext};
use crate::io::registry::Registry;
use crate::strategy::{IterationStrategy, RoleCall, RunContext, call_role, prompt_json, settle};

pub struct PlanExecuteStrategy {
    registry: Arc<dyn Registry>,
    pipeline: Arc<StepPipeline>,
    config: PlanExecuteConfig,
}

impl PlanExecuteStrategy {
    pub fn new(registry: Arc<dyn Registry>, config: &EngineConfig) -> Self {
        let pipeline = Arc::new(StepPipeline::new(Arc::clone(&registry), config));
        Self::with_pipeline(registry, pipeline, config.plan_execute.clone())
    }

    pub fn with_pipeline(
        registry: Arc<dyn Registry>,
        pipeline: Arc<StepPipeline>,
        config: PlanExecuteConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            config,
        }
    }

    async fn run_loop(
        &self,
        run: &mut RunContext,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> anyhow::Result<StopReason> {
        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            run.iterations = iteration;
            observer.on_event(RunEvent::IterationStarted { iteration });

            let context = InvocationContext::new(&run.goal)
                .with_parameter("iteration", iteration)
                .with_auxiliary("tools", self.registry.catalog().render())
                .with_auxiliary("history", prompt_json(&run.history)?);
            let plan = match call_role(self.registry.as_ref(), FunctionRole::Planner, &context, cancel).await? {
                RoleCall::Done(output) => output.content(),
                RoleCall::Missing => {
                    return Ok(StopReason::Blocked {
                        reason: "no planner is registered".to_string(),
                    });
                }
                RoleCall::Failed(error) => {
                    return Ok(StopReason::Blocked {
                        reason: format!("planning failed: {error}"),
                    });
                }
            };
            let actions = extract_actions(&plan);
            run.shared.insert("last_plan".to_string(), plan);
            if actions.is_empty() {
                debug!(iteration, "planner proposed no actions");
            }

            let mut finish_requested = false;
            let mut step_number = 0;
            for action in &actions {
                if action.kind == ActionKind::Finish {
                    finish_requested = true;
                    break;
                }
                step_number += 1;
                observer.on_event(RunEvent::ActionChosen {
                    iteration,
                    action: action.clone(),
                });
                let step = action.to_step(step_number, format!("iteration {iteration}, action {step_number}"));
                let started = Instant::now();
                let result = self
                    .pipeline
                    .run_step(&step, &run.goal, &run.bindings, observer, cancel)
                    .await?;
                observer.on_event(RunEvent::StepCompleted(result.clone()));

                if result.is_success {
                    if let Some(variable) = &action.output_variable {
                        run.bindings
                            .set(variable.clone(), result.output.clone().unwrap_or_default());
                    }
                } else {
                    warn!(iteration, target = %action.name, error = result.error_text(), "action failed");
                }
                run.history.push(HistoryEntry {
                    iteration,
                    action: action.clone(),
                    is_success: result.is_success,
                    output: result.output,
                    error_message: result.error_message,
                    execution_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }

            if finish_requested || self.check_completion(run, cancel).await? {
                run.is_complete = true;
                info!(iteration, "goal achieved");
                return Ok(StopReason::GoalAchieved);
            }
        }
        Ok(StopReason::MaxIterationsExceeded {
            max_iterations: self.config.max_iterations,
        })
    }

    /// A failing checker counts as "not complete yet".
    async fn check_completion(&self, run: &RunContext, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let context =
            InvocationContext::new(&run.goal).with_auxiliary("history", prompt_json(&run.history)?);
        let complete = match call_role(
            self.registry.as_ref(),
            FunctionRole::CompletionChecker,
            &context,
            cancel,
        )
        .await?
        {
            RoleCall::Done(output) => parse_completion(&output.content()).unwrap_or(false),
            RoleCall::Missing => {
                enough_successes(&run.history, self.config.heuristic_success_threshold)
            }
            RoleCall::Failed(error) => {
                warn!(%error, "completion check failed");
                false
            }
        };
        Ok(complete)
    }
}

#[async_trait]
impl IterationStrategy for PlanExecuteStrategy {
    fn name(&self) -> &'static str {
        "plan_execute"
    }

    #[instrument(skip_all, fields(strategy = "plan_execute", max_iterations = self.config.max_iterations))]
    async fn execute_with(
        &self,
        goal: &str,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, Cancelled> {
        let mut run = RunContext::new(goal);
        let stop = settle(self.run_loop(&mut run, observer, cancel).await)?;
        let final_answer = run
            .history
            .iter()
            .rev()
            .find(|entry| entry.is_success)
            .and_then(|entry| entry.output.clone());
        Ok(run.finish(stop, final_answer))
    }
}
