//! Result and history types shared by the interpreter and strategies.
//!
//! These are plain data: every outcome, including failures, is represented
//! here rather than as an error crossing the interpreter/strategy boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::plan::Step;

/// Outcome of one interpreted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    pub step_number: u32,
    pub description: String,
    pub target_name: String,
    pub is_success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub output_variable: Option<String>,
    /// Parameters actually sent to the target after binding.
    pub bound_parameters: Option<String>,
}

impl StepExecutionResult {
    pub fn success(step: &Step, output: Option<String>) -> Self {
        Self {
            is_success: true,
            output,
            ..Self::blank(step)
        }
    }

    pub fn failure(step: &Step, error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            error_message: Some(error.into()),
            ..Self::blank(step)
        }
    }

    pub fn with_parameters(mut self, parameters: Option<String>) -> Self {
        self.bound_parameters = parameters;
        self
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.execution_time_ms = elapsed_ms;
        self
    }

    /// Error text, falling back to a generic message for silent failures.
    pub fn error_text(&self) -> &str {
        self.error_message
            .as_deref()
            .filter(|msg| !msg.trim().is_empty())
            .unwrap_or("step reported failure")
    }

    fn blank(step: &Step) -> Self {
        Self {
            step_number: step.step_number,
            description: step.description.clone(),
            target_name: step.target_name.clone(),
            is_success: false,
            output: None,
            error_message: None,
            execution_time_ms: 0,
            output_variable: step.output_variable.clone(),
            bound_parameters: None,
        }
    }
}

/// Terminal result of one interpreter pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub is_success: bool,
    pub steps: Vec<StepExecutionResult>,
    pub error_message: Option<String>,
    pub summary: Option<String>,
    pub total_execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            steps: Vec::new(),
            error_message: Some(error.into()),
            summary: None,
            total_execution_time_ms: 0,
        }
    }
}

/// Kind of action named by a model decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Tool,
    Function,
    Finish,
}

impl ActionKind {
    /// Lenient parse of the `type` field emitted by planning models.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "tool" | "tool_call" | "call_tool" => Some(Self::Tool),
            "function" | "model_function" | "llm" | "ai_function" => Some(Self::Function),
            "finish" | "final" | "final_answer" | "done" | "stop" => Some(Self::Finish),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Function => "function",
            Self::Finish => "finish",
        }
    }
}

/// A typed action extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl Action {
    pub fn finish() -> Self {
        Self {
            kind: ActionKind::Finish,
            name: String::new(),
            parameters: None,
            output_variable: None,
        }
    }

    /// Turn the action into a single interpretable step.
    pub fn to_step(&self, step_number: u32, description: impl Into<String>) -> Step {
        Step {
            step_number,
            description: description.into(),
            target_name: self.name.clone(),
            raw_parameters: self.parameters.as_ref().and_then(|params| match params {
                Value::Null => None,
                Value::String(text) => Some(text.clone()),
                other => Some(other.to_string()),
            }),
            output_variable: self.output_variable.clone(),
        }
    }
}

/// One executed action in a plan-execute-evaluate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub action: Action,
    pub is_success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

/// One reason/act/observe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactRecord {
    pub iteration: u32,
    pub thought: String,
    pub action: Action,
    pub observation: String,
}

/// Why an iteration strategy stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The completion check reported the goal as achieved.
    GoalAchieved,
    /// The model chose to finish (or produced an unusable decision).
    Finished,
    /// The loop ran out of iterations before completing.
    MaxIterationsExceeded { max_iterations: u32 },
    /// Planning could not proceed (missing or failing planner).
    Blocked { reason: String },
    /// Unexpected error while running the loop.
    Failed { error: String },
}

impl StopReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::MaxIterationsExceeded { .. } | Self::Blocked { .. } | Self::Failed { .. }
        )
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::GoalAchieved | Self::Finished => None,
            Self::MaxIterationsExceeded { max_iterations } => {
                Some(format!("maximum iterations exceeded ({max_iterations})"))
            }
            Self::Blocked { reason } => Some(reason.clone()),
            Self::Failed { error } => Some(error.clone()),
        }
    }
}

/// Terminal result of an iteration strategy run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOutcome {
    pub is_success: bool,
    pub is_complete: bool,
    pub iterations: u32,
    pub stop: StopReason,
    pub error_message: Option<String>,
    pub final_answer: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub records: Vec<ReactRecord>,
    pub bindings: Value,
    pub shared_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_kind_parse_is_lenient() {
        assert_eq!(ActionKind::parse(" Tool "), Some(ActionKind::Tool));
        assert_eq!(ActionKind::parse("final_answer"), Some(ActionKind::Finish));
        assert_eq!(ActionKind::parse("llm"), Some(ActionKind::Function));
        assert_eq!(ActionKind::parse("dance"), None);
    }

    #[test]
    fn action_to_step_stringifies_parameters() {
        let action = Action {
            kind: ActionKind::Tool,
            name: "ReadFile".to_string(),
            parameters: Some(json!({"path": "a.txt"})),
            output_variable: Some("raw".to_string()),
        };
        let step = action.to_step(4, "read");
        assert_eq!(step.step_number, 4);
        assert_eq!(step.raw_parameters.as_deref(), Some(r#"{"path":"a.txt"}"#));
        assert_eq!(step.output_variable.as_deref(), Some("raw"));
    }

    #[test]
    fn stop_reason_error_messages() {
        assert_eq!(StopReason::GoalAchieved.error_message(), None);
        assert_eq!(
            StopReason::MaxIterationsExceeded { max_iterations: 3 }.error_message(),
            Some("maximum iterations exceeded (3)".to_string())
        );
        assert!(StopReason::Blocked { reason: "x".into() }.is_error());
        assert!(!StopReason::Finished.is_error());
    }
}
