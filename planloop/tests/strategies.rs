//! Strategy runs over scripted model functions and tools.

use std::sync::Arc;

use futures::StreamExt;
use planloop::core::types::StopReason;
use planloop::events::{RunEvent, RunStreamItem};
use planloop::io::config::EngineConfig;
use planloop::io::model::{FunctionRole, ModelFunction};
use planloop::io::tool::{Tool, ToolOutput};
use planloop::strategy::{IterationStrategy, PlanExecuteStrategy, ReactStrategy, execute_stream};
use planloop::test_support::{ScriptedFunction, ScriptedTool, registry};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn react_finishes_on_second_cycle_and_summarizes_once() {
    let search = Arc::new(ScriptedTool::returning("Search", json!("found 3 matches")));
    let summarizer = Arc::new(ScriptedFunction::text(FunctionRole::Summarizer, "There are 3 matches."));
    let registry = registry(
        vec![search.clone() as Arc<dyn Tool>],
        vec![
            Arc::new(ScriptedFunction::text(FunctionRole::Reasoner, "I should search first.")),
            Arc::new(ScriptedFunction::sequence(
                FunctionRole::ActionPlanner,
                vec![
                    json!({"type": "tool", "name": "Search", "parameters": {"query": "matches"}}),
                    json!({"type": "finish"}),
                ],
            )) as Arc<dyn ModelFunction>,
            summarizer.clone(),
        ],
    );
    let strategy = ReactStrategy::new(registry, &EngineConfig::default());

    let outcome = strategy
        .execute("count the matches", &CancellationToken::new())
        .await
        .expect("not cancelled");

    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.stop, StopReason::Finished);
    assert!(outcome.is_success);
    assert!(outcome.is_complete);
    assert_eq!(summarizer.calls(), 1);
    assert_eq!(outcome.final_answer.as_deref(), Some("There are 3 matches."));
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].thought, "I should search first.");
    assert_eq!(outcome.records[0].observation, "found 3 matches");
    assert_eq!(search.inputs(), vec![json!({"query": "matches"})]);
    assert_eq!(outcome.shared_data["last_observation"], json!("found 3 matches"));
}

#[tokio::test]
async fn react_binds_outputs_for_later_actions() {
    let echo = Arc::new(ScriptedTool::echo("Echo"));
    let registry = registry(
        vec![echo.clone() as Arc<dyn Tool>],
        vec![Arc::new(ScriptedFunction::sequence(
            FunctionRole::ActionPlanner,
            vec![
                json!({"type": "tool", "name": "Echo", "parameters": "seed", "outputVariable": "first"}),
                json!({"type": "tool", "name": "Echo", "parameters": "after {first}"}),
                json!({"type": "finish", "answer": "done"}),
            ],
        )) as Arc<dyn ModelFunction>],
    );
    let strategy = ReactStrategy::new(registry, &EngineConfig::default());

    let outcome = strategy.execute("g", &CancellationToken::new()).await.expect("not cancelled");

    assert_eq!(echo.inputs(), vec![json!("seed"), json!("after seed")]);
    assert_eq!(outcome.bindings["first"], json!("seed"));
    assert_eq!(outcome.final_answer.as_deref(), Some("done"));
}

#[tokio::test]
async fn plan_execute_stops_at_max_iterations_when_never_complete() {
    let echo = Arc::new(ScriptedTool::echo("Echo"));
    let checker = Arc::new(ScriptedFunction::json(
        FunctionRole::CompletionChecker,
        json!({"isComplete": false}),
    ));
    let planner = Arc::new(ScriptedFunction::json(
        FunctionRole::Planner,
        json!({"actions": [{"type": "tool", "name": "Echo", "parameters": "tick"}]}),
    ));
    let registry = registry(
        vec![echo.clone() as Arc<dyn Tool>],
        vec![planner.clone() as Arc<dyn ModelFunction>, checker.clone()],
    );
    let mut config = EngineConfig::default();
    config.plan_execute.max_iterations = 3;
    let strategy = PlanExecuteStrategy::new(registry, &config);

    let outcome = strategy.execute("never done", &CancellationToken::new()).await.expect("not cancelled");

    assert_eq!(outcome.iterations, 3);
    assert!(!outcome.is_success);
    assert!(!outcome.is_complete);
    assert_eq!(outcome.stop, StopReason::MaxIterationsExceeded { max_iterations: 3 });
    assert_eq!(outcome.error_message.as_deref(), Some("maximum iterations exceeded (3)"));
    assert_eq!(planner.calls(), 3);
    assert_eq!(checker.calls(), 3);
    assert_eq!(echo.inputs().len(), 3);
    assert_eq!(outcome.final_answer.as_deref(), Some("tick"));
}

#[tokio::test]
async fn plan_execute_sees_history_on_later_iterations() {
    let planner = Arc::new(ScriptedFunction::json(
        FunctionRole::Planner,
        json!([{"type": "tool", "name": "Echo", "parameters": "x"}]),
    ));
    let registry = registry(
        vec![Arc::new(ScriptedTool::echo("Echo")) as Arc<dyn Tool>],
        vec![
            planner.clone() as Arc<dyn ModelFunction>,
            Arc::new(ScriptedFunction::sequence(
                FunctionRole::CompletionChecker,
                vec![json!({"isComplete": false}), json!({"isComplete": true})],
            )),
        ],
    );
    let strategy = PlanExecuteStrategy::new(registry, &EngineConfig::default());

    let outcome = strategy.execute("g", &CancellationToken::new()).await.expect("not cancelled");

    assert_eq!(outcome.stop, StopReason::GoalAchieved);
    assert_eq!(outcome.iterations, 2);
    let contexts = planner.contexts();
    assert_eq!(contexts[0].parameters["iteration"], json!(1));
    assert_eq!(contexts[0].auxiliary.get("history").map(String::as_str), Some(""));
    assert_eq!(contexts[1].parameters["iteration"], json!(2));
    assert!(
        contexts[1]
            .auxiliary
            .get("history")
            .is_some_and(|history| history.contains("Echo"))
    );
}

/// Streaming surfaces function chunks alongside the step events and ends
/// with the outcome.
#[tokio::test]
async fn plan_execute_stream_reports_chunks_and_outcome() {
    let transformer = ScriptedFunction::text(FunctionRole::TextTransformer, "Hello").streaming(&["Hel", "lo"]);
    let registry = registry(
        Vec::new(),
        vec![
            Arc::new(ScriptedFunction::sequence(
                FunctionRole::Planner,
                vec![
                    json!({"actions": [{"type": "function", "name": "text_transformer", "parameters": "hello"}]}),
                    json!({"actions": [{"type": "finish"}]}),
                ],
            )) as Arc<dyn ModelFunction>,
            Arc::new(transformer),
            Arc::new(ScriptedFunction::json(FunctionRole::CompletionChecker, json!({"isComplete": false}))),
        ],
    );
    let strategy = PlanExecuteStrategy::new(registry, &EngineConfig::default());
    let cancel = CancellationToken::new();

    let items: Vec<_> = execute_stream(&strategy, "shout", &cancel).collect().await;

    let chunks: Vec<&str> = items
        .iter()
        .filter_map(|item| match item {
            RunStreamItem::Event(RunEvent::Chunk { text, .. }) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["Hel", "lo"]);
    assert!(matches!(
        items.first(),
        Some(RunStreamItem::Event(RunEvent::IterationStarted { iteration: 1 }))
    ));
    match items.last() {
        Some(RunStreamItem::Finished(Ok(outcome))) => {
            assert_eq!(outcome.stop, StopReason::GoalAchieved);
            assert_eq!(outcome.iterations, 2);
            assert_eq!(outcome.final_answer.as_deref(), Some("Hello"));
        }
        other => panic!("unexpected tail: {other:?}"),
    }
}

#[tokio::test]
async fn react_stream_orders_cycle_events() {
    let registry = registry(
        vec![Arc::new(ScriptedTool::returning("Look", json!("a red door"))) as Arc<dyn Tool>],
        vec![
            Arc::new(ScriptedFunction::text(FunctionRole::Reasoner, "Look around.")) as Arc<dyn ModelFunction>,
            Arc::new(ScriptedFunction::sequence(
                FunctionRole::ActionPlanner,
                vec![json!({"type": "tool", "name": "Look"}), json!({"type": "finish"})],
            )),
        ],
    );
    let strategy = ReactStrategy::new(registry, &EngineConfig::default());
    let cancel = CancellationToken::new();

    let items: Vec<_> = execute_stream(&strategy, "describe the room", &cancel).collect().await;

    let kinds: Vec<&str> = items
        .iter()
        .map(|item| match item {
            RunStreamItem::Event(RunEvent::IterationStarted { .. }) => "iteration",
            RunStreamItem::Event(RunEvent::Thought { .. }) => "thought",
            RunStreamItem::Event(RunEvent::ActionChosen { .. }) => "action",
            RunStreamItem::Event(RunEvent::Chunk { .. }) => "chunk",
            RunStreamItem::Event(RunEvent::StepCompleted(_)) => "step",
            RunStreamItem::Event(RunEvent::Observation { .. }) => "observation",
            RunStreamItem::Finished(_) => "finished",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "iteration",
            "thought",
            "action",
            "step",
            "observation",
            "iteration",
            "thought",
            "finished"
        ]
    );
    match items.last() {
        Some(RunStreamItem::Finished(Ok(outcome))) => {
            assert_eq!(outcome.final_answer.as_deref(), Some("a red door"));
        }
        other => panic!("unexpected tail: {other:?}"),
    }
}

#[tokio::test]
async fn pre_cancelled_runs_return_cancelled() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let registry = registry(
        Vec::new(),
        vec![Arc::new(ScriptedFunction::json(FunctionRole::Planner, json!([]))) as Arc<dyn ModelFunction>],
    );

    let react = ReactStrategy::new(registry.clone(), &EngineConfig::default());
    assert!(react.execute("g", &cancel).await.is_err());

    let plan_execute = PlanExecuteStrategy::new(registry, &EngineConfig::default());
    assert!(plan_execute.execute("g", &cancel).await.is_err());
}

/// A tool that cancels the run mid-flight stops the loop before the next
/// iteration; the summarizer is not consulted.
#[tokio::test]
async fn cancellation_during_a_cycle_ends_the_run() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let summarizer = Arc::new(ScriptedFunction::text(FunctionRole::Summarizer, "unused"));
    let registry = registry(
        vec![Arc::new(ScriptedTool::new("Stop", move |_| {
            trigger.cancel();
            Ok(ToolOutput::success(json!("stopping")))
        })) as Arc<dyn Tool>],
        vec![
            Arc::new(ScriptedFunction::json(
                FunctionRole::ActionPlanner,
                json!({"type": "tool", "name": "Stop"}),
            )) as Arc<dyn ModelFunction>,
            summarizer.clone(),
        ],
    );
    let strategy = ReactStrategy::new(registry, &EngineConfig::default());

    let result = strategy.execute("g", &cancel).await;

    assert!(result.is_err());
    assert_eq!(summarizer.calls(), 0);
}
