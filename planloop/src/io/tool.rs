//! Deterministic executable capabilities.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a tool expects from its caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContract {
    pub description: String,
    /// When false, bound parameters are passed through without validation.
    pub requires_parameters: bool,
    /// JSON Schema for the parameters, if the tool publishes one.
    pub input_schema: Option<Value>,
}

/// Result reported by a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutput {
    pub is_success: bool,
    pub data: Option<Value>,
    pub error_message: Option<String>,
}

impl ToolOutput {
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            is_success: true,
            data: Some(data.into()),
            error_message: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            is_success: true,
            data: None,
            error_message: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            data: None,
            error_message: Some(error.into()),
        }
    }
}

/// A named capability invoked with a JSON value.
///
/// `Err` is reserved for failures the tool could not report itself; the
/// interpreter folds both into a failed step.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> &str {
        "general"
    }

    fn contract(&self) -> ToolContract {
        ToolContract::default()
    }

    async fn execute(&self, input: Value) -> anyhow::Result<ToolOutput>;
}
