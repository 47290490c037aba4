//! Model-backed functions addressed by role.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::bindings::render_value;
use crate::core::model_output::{extract_json, field};

/// The job a model function performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionRole {
    Planner,
    ActionPlanner,
    Reasoner,
    CompletionChecker,
    Summarizer,
    ParameterGenerator,
    TextTransformer,
}

impl FunctionRole {
    pub const ALL: [FunctionRole; 7] = [
        Self::Planner,
        Self::ActionPlanner,
        Self::Reasoner,
        Self::CompletionChecker,
        Self::Summarizer,
        Self::ParameterGenerator,
        Self::TextTransformer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::ActionPlanner => "action_planner",
            Self::Reasoner => "reasoner",
            Self::CompletionChecker => "completion_checker",
            Self::Summarizer => "summarizer",
            Self::ParameterGenerator => "parameter_generator",
            Self::TextTransformer => "text_transformer",
        }
    }
}

impl fmt::Display for FunctionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionRole {
    type Err = anyhow::Error;

    /// Case-insensitive; `_`, `-` and spaces are ignored, so `ActionPlanner`,
    /// `action-planner` and `action_planner` all match.
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "planner" => Ok(Self::Planner),
            "actionplanner" => Ok(Self::ActionPlanner),
            "reasoner" => Ok(Self::Reasoner),
            "completionchecker" | "evaluator" => Ok(Self::CompletionChecker),
            "summarizer" => Ok(Self::Summarizer),
            "parametergenerator" => Ok(Self::ParameterGenerator),
            "texttransformer" => Ok(Self::TextTransformer),
            _ => Err(anyhow!("unknown model function role: {s}")),
        }
    }
}

/// Input handed to a model function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationContext {
    pub goal: String,
    pub parameters: Map<String, Value>,
    /// Extra prompt material keyed by section (history, bindings, ...).
    pub auxiliary: BTreeMap<String, String>,
}

impl InvocationContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_auxiliary(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.auxiliary.insert(key.into(), text.into());
        self
    }
}

/// Result of one model function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionOutput {
    pub is_success: bool,
    pub parsed: Option<Value>,
    pub raw_response: Option<String>,
    pub error_message: Option<String>,
}

impl FunctionOutput {
    /// Wrap a raw reply, mining it for JSON.
    pub fn from_reply(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            is_success: true,
            parsed: extract_json(&raw),
            raw_response: Some(raw),
            error_message: None,
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            is_success: true,
            raw_response: Some(value.to_string()),
            parsed: Some(value),
            error_message: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            parsed: None,
            raw_response: None,
            error_message: Some(error.into()),
        }
    }

    /// Parsed result if any, else the raw text, else null.
    pub fn content(&self) -> Value {
        match (&self.parsed, &self.raw_response) {
            (Some(parsed), _) => parsed.clone(),
            (None, Some(raw)) => Value::String(raw.clone()),
            (None, None) => Value::Null,
        }
    }

    /// Best human-readable text: a well-known text field of the parsed
    /// object, else the raw reply.
    pub fn text(&self) -> Option<String> {
        let named = self.parsed.as_ref().and_then(Value::as_object).and_then(|map| {
            field(map, &["answer", "summary", "thought", "content", "text", "result"])
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        named
            .or_else(|| self.raw_response.clone())
            .or_else(|| self.parsed.as_ref().map(render_value))
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }
}

/// One piece of a streamed function result.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionChunk {
    pub text: String,
    /// The last chunk carries the parsed result of the whole reply.
    pub is_final: bool,
    pub parsed: Option<Value>,
}

impl FunctionChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            parsed: None,
        }
    }

    pub fn last(parsed: Option<Value>) -> Self {
        Self {
            text: String::new(),
            is_final: true,
            parsed,
        }
    }
}

pub type ChunkStream = BoxStream<'static, Result<FunctionChunk>>;

/// A model-backed capability such as planning or summarizing.
#[async_trait]
pub trait ModelFunction: Send + Sync {
    fn role(&self) -> FunctionRole;

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn execute(&self, context: &InvocationContext) -> Result<FunctionOutput>;

    /// Defaults to one final chunk holding the whole non-streamed reply.
    async fn execute_stream(&self, context: &InvocationContext) -> Result<ChunkStream> {
        let output = self.execute(context).await?;
        if !output.is_success {
            return Err(anyhow!(
                "{}",
                output
                    .error_message
                    .unwrap_or_else(|| format!("{} failed", self.role()))
            ));
        }
        let text = output.raw_response.unwrap_or_default();
        let chunks = vec![Ok(FunctionChunk::partial(text)), Ok(FunctionChunk::last(output.parsed))];
        Ok(stream::iter(chunks).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_parsing_ignores_case_and_separators() {
        assert_eq!("ActionPlanner".parse::<FunctionRole>().ok(), Some(FunctionRole::ActionPlanner));
        assert_eq!("action-planner".parse::<FunctionRole>().ok(), Some(FunctionRole::ActionPlanner));
        assert_eq!("Completion Checker".parse::<FunctionRole>().ok(), Some(FunctionRole::CompletionChecker));
        assert_eq!("evaluator".parse::<FunctionRole>().ok(), Some(FunctionRole::CompletionChecker));
        assert!("juggler".parse::<FunctionRole>().is_err());
        for role in FunctionRole::ALL {
            assert_eq!(role.as_str().parse::<FunctionRole>().ok(), Some(role));
        }
    }

    #[test]
    fn output_text_prefers_named_fields() {
        let output = FunctionOutput::from_reply(r#"{"summary": " all done "}"#);
        assert_eq!(output.text().as_deref(), Some("all done"));

        let prose = FunctionOutput::from_reply("plain words");
        assert_eq!(prose.parsed, None);
        assert_eq!(prose.text().as_deref(), Some("plain words"));
        assert_eq!(prose.content(), json!("plain words"));

        assert_eq!(FunctionOutput::failure("x").text(), None);
    }
}
