//! Reason, act, observe.
//!
//! One action per cycle: a thought from the reasoner, a decision from the
//! action planner, one executed step, and its observation. After the loop a
//! summarizer (when registered) writes the final answer, whatever the stop
//! reason was.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{Cancelled, is_cancellation};
use crate::core::heuristics::mentions_goal_achieved;
use crate::core::model_output::{Decision, parse_completion, parse_decision};
use crate::core::types::{Action, ReactRecord, StopReason, StrategyOutcome};
use crate::events::{RunEvent, RunObserver};
use crate::interpreter::StepPipeline;
use crate::io::config::{EngineConfig, ReactConfig};
use crate::io::model::{FunctionRole, InvocationContext};
use crate::io::registry::Registry;
use crate::strategy::{IterationStrategy, RoleCall, RunContext, call_role, prompt_json, settle};

/// Used when no reasoner can produce a thought.
pub const FALLBACK_THOUGHT: &str = "Continue working toward the goal.";

pub struct ReactStrategy {
    registry: Arc<dyn Registry>,
    pipeline: Arc<StepPipeline>,
    config: ReactConfig,
}

/// Loop result before summarization.
struct LoopEnd {
    stop: StopReason,
    answer: Option<String>,
}

impl ReactStrategy {
    pub fn new(registry: Arc<dyn Registry>, config: &EngineConfig) -> Self {
        let pipeline = Arc::new(StepPipeline::new(Arc::clone(&registry), config));
        Self::with_pipeline(registry, pipeline, config.react.clone())
    }

    pub fn with_pipeline(registry: Arc<dyn Registry>, pipeline: Arc<StepPipeline>, config: ReactConfig) -> Self {
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
    ) -> anyhow::Result<LoopEnd> {
        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            run.iterations = iteration;
            observer.on_event(RunEvent::IterationStarted { iteration });

            let history = prompt_json(&run.records)?;
            let thought = self.think(&run.goal, &history, cancel).await?;
            observer.on_event(RunEvent::Thought {
                iteration,
                text: thought.clone(),
            });

            let action = match self.decide(&run.goal, &history, &thought, cancel).await? {
                Decision::Act(action) => action,
                Decision::Finish { answer, explicit } => {
                    debug!(iteration, explicit, "model chose to finish");
                    run.is_complete = explicit;
                    return Ok(LoopEnd {
                        stop: StopReason::Finished,
                        answer,
                    });
                }
            };
            observer.on_event(RunEvent::ActionChosen {
                iteration,
                action: action.clone(),
            });

            let observation = self.act(run, iteration, &thought, &action, observer, cancel).await?;
            observer.on_event(RunEvent::Observation {
                iteration,
                text: observation.clone(),
            });
            run.shared
                .insert("last_observation".to_string(), Value::String(observation.clone()));
            let record = ReactRecord {
                iteration,
                thought,
                action,
                observation,
            };
            run.shared
                .insert("last_record".to_string(), serde_json::to_value(&record)?);
            run.records.push(record);

            if iteration >= self.config.goal_check_min_cycles && self.goal_achieved(run, cancel).await? {
                run.is_complete = true;
                info!(iteration, "goal achieved");
                return Ok(LoopEnd {
                    stop: StopReason::GoalAchieved,
                    answer: None,
                });
            }
        }
        Ok(LoopEnd {
            stop: StopReason::MaxIterationsExceeded {
                max_iterations: self.config.max_iterations,
            },
            answer: None,
        })
    }

    async fn think(&self, goal: &str, history: &str, cancel: &CancellationToken) -> Result<String, Cancelled> {
        let context = InvocationContext::new(goal).with_auxiliary("history", history);
        let thought = match call_role(self.registry.as_ref(), FunctionRole::Reasoner, &context, cancel).await? {
            RoleCall::Done(output) => output.text(),
            RoleCall::Missing => None,
            RoleCall::Failed(error) => {
                warn!(%error, "reasoner failed");
                None
            }
        };
        Ok(thought.unwrap_or_else(|| FALLBACK_THOUGHT.to_string()))
    }

    /// A missing or failing action planner ends the loop as if it chose to
    /// finish.
    async fn decide(
        &self,
        goal: &str,
        history: &str,
        thought: &str,
        cancel: &CancellationToken,
    ) -> Result<Decision, Cancelled> {
        let context = InvocationContext::new(goal)
            .with_auxiliary("tools", self.registry.catalog().render())
            .with_auxiliary("history", history)
            .with_auxiliary("thought", thought);
        let decision = match call_role(self.registry.as_ref(), FunctionRole::ActionPlanner, &context, cancel).await? {
            RoleCall::Done(output) => parse_decision(&output.content()),
            RoleCall::Missing => {
                warn!("no action planner is registered");
                Decision::Finish {
                    answer: None,
                    explicit: false,
                }
            }
            RoleCall::Failed(error) => {
                warn!(%error, "action planner failed");
                Decision::Finish {
                    answer: None,
                    explicit: false,
                }
            }
        };
        Ok(decision)
    }

    /// Run the action as a one-step plan and describe what happened.
    async fn act(
        &self,
        run: &mut RunContext,
        iteration: u32,
        thought: &str,
        action: &Action,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<String, Cancelled> {
        let step = action.to_step(iteration, thought);
        let result = self
            .pipeline
            .run_step(&step, &run.goal, &run.bindings, observer, cancel)
            .await?;
        observer.on_event(RunEvent::StepCompleted(result.clone()));
        if !result.is_success {
            return Ok(format!("Error: {}", result.error_text()));
        }
        let output = result.output.unwrap_or_default();
        if let Some(variable) = &action.output_variable {
            run.bindings.set(variable.clone(), output.clone());
        }
        if output.trim().is_empty() {
            Ok("(no output)".to_string())
        } else {
            Ok(output)
        }
    }

    /// Checker verdict when one is registered and answers; the keyword
    /// heuristic on the last observation otherwise.
    async fn goal_achieved(&self, run: &RunContext, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let context =
            InvocationContext::new(&run.goal).with_auxiliary("history", prompt_json(&run.records)?);
        let verdict = match call_role(
            self.registry.as_ref(),
            FunctionRole::CompletionChecker,
            &context,
            cancel,
        )
        .await?
        {
            RoleCall::Done(output) => parse_completion(&output.content()),
            RoleCall::Missing => None,
            RoleCall::Failed(error) => {
                warn!(%error, "completion check failed; using keyword heuristic");
                None
            }
        };
        Ok(verdict.unwrap_or_else(|| {
            run.records.last().is_some_and(|record| {
                mentions_goal_achieved(&record.observation, &self.config.goal_keywords)
            })
        }))
    }

    /// Final answer from the summarizer, falling back to the loop's own
    /// answer or the last observation.
    async fn summarize(
        &self,
        run: &RunContext,
        end: &LoopEnd,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<String>> {
        let fallback = end.answer.clone().or_else(|| {
            run.records
                .last()
                .map(|record| record.observation.clone())
        });
        let stop_reason = end
            .stop
            .error_message()
            .unwrap_or_else(|| match end.stop {
                StopReason::GoalAchieved => "goal achieved".to_string(),
                _ => "finished".to_string(),
            });
        let mut context = InvocationContext::new(&run.goal)
            .with_parameter("stop_reason", stop_reason)
            .with_auxiliary("history", prompt_json(&run.records)?);
        if let Some(answer) = &end.answer {
            context = context.with_parameter("proposed_answer", answer.clone());
        }
        let answer = match call_role(self.registry.as_ref(), FunctionRole::Summarizer, &context, cancel).await? {
            RoleCall::Done(output) => output.text().or(fallback),
            RoleCall::Missing => fallback,
            RoleCall::Failed(error) => {
                warn!(%error, "summarizer failed");
                fallback
            }
        };
        Ok(answer)
    }
}

#[async_trait]
impl IterationStrategy for ReactStrategy {
    fn name(&self) -> &'static str {
        "react"
    }

    #[instrument(skip_all, fields(strategy = "react", max_iterations = self.config.max_iterations))]
    async fn execute_with(
        &self,
        goal: &str,
        observer: &mut dyn RunObserver,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, Cancelled> {
        let mut run = RunContext::new(goal);
        let end = match self.run_loop(&mut run, observer, cancel).await {
            Ok(end) => end,
            Err(err) => LoopEnd {
                stop: settle(Err(err))?,
                answer: None,
            },
        };
        let final_answer = match self.summarize(&run, &end, cancel).await {
            Ok(answer) => answer,
            Err(err) if is_cancellation(&err) => return Err(Cancelled),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "final answer synthesis failed");
                end.answer.clone()
            }
        };
        Ok(run.finish(end.stop, final_answer))
    }
}
