//! Engine configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::circuit::BreakerPolicy;
use crate::core::heuristics::DEFAULT_GOAL_KEYWORDS;
use crate::core::placeholder::{
    DEFAULT_ARRAY_PROPERTIES, DEFAULT_CONTENT_PROPERTIES, SubstitutionRules,
};

/// Engine configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub plan_execute: PlanExecuteConfig,
    pub react: ReactConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub binding: BindingConfig,
    pub function: FunctionSettings,
    /// Merged into every model-function invocation made for a plan step.
    /// Bound step parameters win on key collisions.
    pub ambient_parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanExecuteConfig {
    pub max_iterations: u32,
    /// Successful actions that count as complete when no checker is registered.
    pub heuristic_success_threshold: usize,
}

impl Default for PlanExecuteConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            heuristic_success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReactConfig {
    pub max_iterations: u32,
    /// First cycle at which the goal check runs.
    pub goal_check_min_cycles: u32,
    /// Phrases the keyword fallback looks for in observations.
    pub goal_keywords: Vec<String>,
}

impl Default for ReactConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            goal_check_min_cycles: 2,
            goal_keywords: DEFAULT_GOAL_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
        }
    }
}

/// Property-name heuristics used when substituting placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BindingConfig {
    /// Tried in order for a bare `{var}` bound to an object.
    pub content_properties: Vec<String>,
    /// Tried in order for `{var[i]}` bound to an object.
    pub array_properties: Vec<String>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            content_properties: DEFAULT_CONTENT_PROPERTIES.iter().map(|s| s.to_string()).collect(),
            array_properties: DEFAULT_ARRAY_PROPERTIES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BindingConfig {
    pub fn rules(&self) -> SubstitutionRules {
        SubstitutionRules {
            content_properties: self.content_properties.clone(),
            array_properties: self.array_properties.clone(),
        }
    }
}

/// Settings for prompt-rendering model functions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FunctionSettings {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Rendered prompts beyond this many bytes lose droppable sections.
    pub prompt_budget_bytes: usize,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            prompt_budget_bytes: 32_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plan_execute: PlanExecuteConfig::default(),
            react: ReactConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            binding: BindingConfig::default(),
            function: FunctionSettings::default(),
            ambient_parameters: Map::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan_execute.max_iterations == 0 {
            return Err(anyhow!("plan_execute.max_iterations must be > 0"));
        }
        if self.react.max_iterations == 0 {
            return Err(anyhow!("react.max_iterations must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow!("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.function.prompt_budget_bytes == 0 {
            return Err(anyhow!("function.prompt_budget_bytes must be > 0"));
        }
        if let Some(temperature) = self.function.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(anyhow!("function.temperature must be within 0.0..=2.0"));
            }
        }
        if self.binding.content_properties.iter().any(|p| p.trim().is_empty())
            || self.binding.array_properties.iter().any(|p| p.trim().is_empty())
        {
            return Err(anyhow!("binding property names must be non-empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.circuit_breaker.policy(), BreakerPolicy::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("engine.toml");
        let mut cfg = EngineConfig::default();
        cfg.react.max_iterations = 4;
        cfg.ambient_parameters
            .insert("language".to_string(), Value::String("en".to_string()));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("engine.toml");
        fs::write(&path, "[plan_execute]\nmax_iterations = 3\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.plan_execute.max_iterations, 3);
        assert_eq!(cfg.plan_execute.heuristic_success_threshold, 3);
        assert_eq!(cfg.react, ReactConfig::default());
    }

    #[test]
    fn zero_iterations_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("engine.toml");
        fs::write(&path, "[react]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("react.max_iterations"));
    }
}
