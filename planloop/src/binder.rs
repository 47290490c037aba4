//! Turning a step's raw parameter template into the parameters actually sent.
//!
//! Binding substitutes placeholders from the binding context and validates
//! the result against the tool's contract. When validation fails, the
//! parameter-generator model function is asked to produce parameters
//! instead; without one, binding fails.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cancel::{self, Cancelled};
use crate::core::bindings::BindingContext;
use crate::core::model_output::field;
use crate::core::placeholder::{SubstitutionRules, substitute, unbound_variables};
use crate::io::model::{FunctionOutput, FunctionRole, InvocationContext};
use crate::io::registry::Registry;
use crate::io::tool::{Tool, ToolContract};

/// Everything binding needs to know about one step.
pub struct BindRequest<'a> {
    /// Set when the step targets a tool; model functions are never validated.
    pub tool: Option<&'a dyn Tool>,
    pub raw_parameters: Option<&'a str>,
    pub goal: &'a str,
    pub step_description: &'a str,
    pub bindings: &'a BindingContext,
}

/// Result of binding. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BindOutcome {
    pub is_success: bool,
    pub parameters: Option<String>,
    pub error_message: Option<String>,
}

impl BindOutcome {
    fn bound(parameters: Option<String>) -> Self {
        Self {
            is_success: true,
            parameters,
            error_message: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            is_success: false,
            parameters: None,
            error_message: Some(error.into()),
        }
    }
}

pub struct ParameterBinder {
    registry: Arc<dyn Registry>,
    rules: SubstitutionRules,
}

impl ParameterBinder {
    pub fn new(registry: Arc<dyn Registry>, rules: SubstitutionRules) -> Self {
        Self { registry, rules }
    }

    pub fn rules(&self) -> &SubstitutionRules {
        &self.rules
    }

    #[instrument(skip_all, fields(tool = ?request.tool.map(|tool| tool.name())))]
    pub async fn process(
        &self,
        request: BindRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<BindOutcome, Cancelled> {
        let substituted = request
            .raw_parameters
            .map(|template| substitute(template, request.bindings, &self.rules));
        if let Some(template) = request.raw_parameters {
            let unbound = unbound_variables(template, request.bindings);
            if !unbound.is_empty() {
                debug!(?unbound, "placeholders left unresolved");
            }
        }

        let Some(tool) = request.tool else {
            return Ok(BindOutcome::bound(substituted));
        };
        let contract = tool.contract();
        let reason = match validate(&contract, substituted.as_deref()) {
            Ok(()) => return Ok(BindOutcome::bound(substituted)),
            Err(reason) => reason,
        };
        debug!(%reason, "parameters failed validation; trying generator");
        self.generate(tool, &contract, &request, &reason, cancel).await
    }

    async fn generate(
        &self,
        tool: &dyn Tool,
        contract: &ToolContract,
        request: &BindRequest<'_>,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<BindOutcome, Cancelled> {
        let Some(generator) = self.registry.model_function(FunctionRole::ParameterGenerator) else {
            return Ok(BindOutcome::failed(format!(
                "parameter validation failed for {}: {reason}",
                tool.name()
            )));
        };
        let bindings = serde_json::to_string_pretty(&request.bindings.snapshot())
            .unwrap_or_else(|_| request.bindings.snapshot().to_string());
        let context = InvocationContext::new(request.goal)
            .with_parameter("tool_name", tool.name())
            .with_parameter("step_description", request.step_description)
            .with_parameter("validation_error", reason)
            .with_parameter(
                "input_schema",
                contract.input_schema.clone().unwrap_or(Value::Null),
            )
            .with_auxiliary("bindings", bindings);

        let output = match cancel::call(cancel, generator.execute(&context)).await? {
            Ok(output) if output.is_success => output,
            Ok(output) => {
                return Ok(BindOutcome::failed(output.error_message.unwrap_or_else(|| {
                    "parameter generation failed".to_string()
                })));
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "parameter generator failed");
                return Ok(BindOutcome::failed(format!("parameter generation failed: {err:#}")));
            }
        };
        let Some(generated) = generated_parameters(&output) else {
            return Ok(BindOutcome::failed("parameter generator returned no parameters"));
        };
        match validate(contract, Some(&generated)) {
            Ok(()) => Ok(BindOutcome::bound(Some(generated))),
            Err(reason) => Ok(BindOutcome::failed(format!(
                "generated parameters are invalid for {}: {reason}",
                tool.name()
            ))),
        }
    }
}

/// Check substituted parameters against a tool contract.
///
/// Only tools that require parameters are checked: the text must be
/// non-empty, well-formed JSON when it looks like JSON, and must satisfy the
/// input schema when one is published.
pub fn validate(contract: &ToolContract, parameters: Option<&str>) -> Result<(), String> {
    if !contract.requires_parameters {
        return Ok(());
    }
    let text = parameters.map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err("parameters are required".to_string());
    }
    let looks_like_json = text.starts_with('{') || text.starts_with('[');
    let instance = if looks_like_json {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(err) => return Err(format!("parameters are not valid JSON: {err}")),
        }
    } else {
        Value::String(text.to_string())
    };
    let Some(schema) = &contract.input_schema else {
        return Ok(());
    };
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            warn!(error = %err, "tool input schema is invalid; skipping schema check");
            return Ok(());
        }
    };
    if validator.is_valid(&instance) {
        return Ok(());
    }
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .take(3)
        .map(|err| err.to_string())
        .collect();
    Err(format!("schema violation: {}", errors.join("; ")))
}

/// The generator's `parameters` field, else its whole structured result,
/// else its raw text.
fn generated_parameters(output: &FunctionOutput) -> Option<String> {
    let from_parsed = output.parsed.as_ref().and_then(|parsed| {
        let chosen = parsed
            .as_object()
            .and_then(|map| field(map, &["parameters", "params", "arguments"]))
            .unwrap_or(parsed);
        (!chosen.is_null()).then(|| match chosen {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    });
    from_parsed
        .or_else(|| output.raw_response.clone())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::registry::InMemoryRegistry;
    use crate::test_support::{ScriptedFunction, ScriptedTool};
    use serde_json::json;

    fn path_schema() -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {"path": {"type": "string"}}
        })
    }

    fn request<'a>(
        tool: Option<&'a dyn Tool>,
        raw: Option<&'a str>,
        bindings: &'a BindingContext,
    ) -> BindRequest<'a> {
        BindRequest {
            tool,
            raw_parameters: raw,
            goal: "goal",
            step_description: "read it",
            bindings,
        }
    }

    #[test]
    fn validate_rules() {
        let optional = ToolContract::default();
        assert!(validate(&optional, None).is_ok());

        let required = ToolContract {
            requires_parameters: true,
            ..ToolContract::default()
        };
        assert!(validate(&required, None).is_err());
        assert!(validate(&required, Some("  ")).is_err());
        assert!(validate(&required, Some("{broken")).is_err());
        assert!(validate(&required, Some("plain text")).is_ok());

        let schema = ToolContract {
            requires_parameters: true,
            input_schema: Some(path_schema()),
            ..ToolContract::default()
        };
        assert!(validate(&schema, Some(r#"{"path": "a.txt"}"#)).is_ok());
        let err = validate(&schema, Some(r#"{"file": "a.txt"}"#)).expect_err("missing path");
        assert!(err.starts_with("schema violation"));
    }

    #[tokio::test]
    async fn substitutes_and_passes_valid_parameters() {
        let registry = Arc::new(InMemoryRegistry::new());
        let binder = ParameterBinder::new(registry, SubstitutionRules::default());
        let tool = ScriptedTool::returning("ReadFile", json!("x")).requiring(Some(path_schema()));
        let mut bindings = BindingContext::new();
        bindings.set("fileList", json!(["a.txt", "b.txt"]));

        let outcome = binder
            .process(
                request(Some(&tool), Some(r#"{"path": "{fileList[1]}"}"#), &bindings),
                &CancellationToken::new(),
            )
            .await
            .expect("not cancelled");

        assert!(outcome.is_success);
        assert_eq!(outcome.parameters.as_deref(), Some(r#"{"path": "b.txt"}"#));
    }

    /// Model-function targets are substituted but never validated.
    #[tokio::test]
    async fn functions_skip_validation() {
        let binder = ParameterBinder::new(Arc::new(InMemoryRegistry::new()), SubstitutionRules::default());
        let bindings = BindingContext::new();
        let outcome = binder
            .process(request(None, Some("{not json"), &bindings), &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(outcome.is_success);
        assert_eq!(outcome.parameters.as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn invalid_without_generator_fails() {
        let binder = ParameterBinder::new(Arc::new(InMemoryRegistry::new()), SubstitutionRules::default());
        let tool = ScriptedTool::returning("ReadFile", json!("x")).requiring(None);
        let bindings = BindingContext::new();

        let outcome = binder
            .process(request(Some(&tool), None, &bindings), &CancellationToken::new())
            .await
            .expect("not cancelled");

        assert!(!outcome.is_success);
        assert!(outcome.error_message.unwrap_or_default().contains("parameters are required"));
    }

    #[tokio::test]
    async fn generator_fills_in_invalid_parameters() {
        let registry = InMemoryRegistry::new();
        let generator = Arc::new(ScriptedFunction::json(
            FunctionRole::ParameterGenerator,
            json!({"parameters": {"path": "a.txt"}}),
        ));
        registry.register_function(generator.clone());
        let binder = ParameterBinder::new(Arc::new(registry), SubstitutionRules::default());
        let tool = ScriptedTool::returning("ReadFile", json!("x")).requiring(Some(path_schema()));
        let bindings = BindingContext::new();

        let outcome = binder
            .process(request(Some(&tool), Some("{}"), &bindings), &CancellationToken::new())
            .await
            .expect("not cancelled");

        assert!(outcome.is_success);
        assert_eq!(outcome.parameters.as_deref(), Some(r#"{"path":"a.txt"}"#));
        let seen = generator.contexts();
        assert_eq!(seen[0].parameters.get("tool_name"), Some(&json!("ReadFile")));
        assert!(seen[0].auxiliary.contains_key("bindings"));
    }

    #[tokio::test]
    async fn generator_output_must_validate() {
        let registry = InMemoryRegistry::new();
        registry.register_function(Arc::new(ScriptedFunction::json(
            FunctionRole::ParameterGenerator,
            json!({"parameters": {"wrong": 1}}),
        )));
        let binder = ParameterBinder::new(Arc::new(registry), SubstitutionRules::default());
        let tool = ScriptedTool::returning("ReadFile", json!("x")).requiring(Some(path_schema()));
        let bindings = BindingContext::new();

        let outcome = binder
            .process(request(Some(&tool), None, &bindings), &CancellationToken::new())
            .await
            .expect("not cancelled");

        assert!(!outcome.is_success);
    }

    #[tokio::test]
    async fn cancelled_generator_propagates() {
        let registry = InMemoryRegistry::new();
        registry.register_function(Arc::new(ScriptedFunction::json(
            FunctionRole::ParameterGenerator,
            json!({"parameters": {"path": "a"}}),
        )));
        let binder = ParameterBinder::new(Arc::new(registry), SubstitutionRules::default());
        let tool = ScriptedTool::returning("ReadFile", json!("x")).requiring(None);
        let bindings = BindingContext::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = binder.process(request(Some(&tool), None, &bindings), &cancel).await;
        assert_eq!(result, Err(Cancelled));
    }
}
