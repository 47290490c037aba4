//! Plan and step model produced by planning collaborators.
//!
//! A plan is immutable once handed to the interpreter. Field names accept both
//! camelCase (what planning models tend to emit) and snake_case.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// An ordered, possibly blocked set of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(alias = "is_executable", default = "default_true")]
    pub is_executable: bool,
    /// Why the plan cannot run. Required when `is_executable` is false.
    #[serde(alias = "execution_blocker", default)]
    pub execution_blocker: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One unit of work naming a tool or model-function role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(alias = "step_number")]
    pub step_number: u32,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "target_name", alias = "target", alias = "tool")]
    pub target_name: String,
    /// Parameter template; may contain `{variable}` placeholders.
    #[serde(
        alias = "raw_parameters",
        alias = "parameters",
        default,
        deserialize_with = "deserialize_template"
    )]
    pub raw_parameters: Option<String>,
    #[serde(alias = "output_variable", default)]
    pub output_variable: Option<String>,
}

impl Plan {
    /// Build an executable plan from steps.
    pub fn executable(steps: Vec<Step>) -> Self {
        Self {
            is_executable: true,
            execution_blocker: None,
            summary: None,
            steps,
        }
    }

    /// Build a blocked plan carrying its reason.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            is_executable: false,
            execution_blocker: Some(reason.into()),
            summary: None,
            steps: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Steps in ascending `step_number` order, regardless of input order.
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.step_number);
        steps
    }

    /// Blocker text for a non-executable plan.
    pub fn blocker_text(&self) -> &str {
        self.execution_blocker
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .unwrap_or("plan is not executable")
    }
}

impl Step {
    pub fn new(step_number: u32, target_name: impl Into<String>) -> Self {
        Self {
            step_number,
            description: String::new(),
            target_name: target_name.into(),
            raw_parameters: None,
            output_variable: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, template: impl Into<String>) -> Self {
        self.raw_parameters = Some(template.into());
        self
    }

    pub fn bind_output(mut self, variable: impl Into<String>) -> Self {
        self.output_variable = Some(variable.into());
        self
    }
}

/// Check plan invariants not expressible in the type:
/// - non-executable plans carry a non-empty blocker
/// - step numbers are unique
///
/// Blank target names are left to resolution, which fails that step alone.
pub fn validate_plan(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();

    if !plan.is_executable
        && plan
            .execution_blocker
            .as_deref()
            .is_none_or(|reason| reason.trim().is_empty())
    {
        errors.push("non-executable plan must carry an execution blocker".to_string());
    }

    let mut seen = HashSet::new();
    for step in &plan.steps {
        if !seen.insert(step.step_number) {
            errors.push(format!("duplicate step number {}", step.step_number));
        }
    }

    errors
}

fn default_true() -> bool {
    true
}

/// Accept either a string template or inline JSON (stringified).
fn deserialize_template<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}
