//! Prompt rendering for model functions.
//!
//! Each role has a template under `io/prompts/`. Templates mark their parts
//! with `<!-- section:KEY required|droppable -->`; when the rendered prompt
//! exceeds the byte budget, droppable sections go first (in [`DROP_ORDER`]),
//! then the last remaining section is truncated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::io::model::{FunctionRole, InvocationContext};

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const ACTION_PLANNER_TEMPLATE: &str = include_str!("prompts/action_planner.md");
const REASONER_TEMPLATE: &str = include_str!("prompts/reasoner.md");
const COMPLETION_CHECKER_TEMPLATE: &str = include_str!("prompts/completion_checker.md");
const SUMMARIZER_TEMPLATE: &str = include_str!("prompts/summarizer.md");
const PARAMETER_GENERATOR_TEMPLATE: &str = include_str!("prompts/parameter_generator.md");
const TEXT_TRANSFORMER_TEMPLATE: &str = include_str!("prompts/text_transformer.md");

/// Droppable sections, least important first.
pub const DROP_ORDER: [&str; 3] = ["bindings", "history", "parameters"];

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

fn template_source(role: FunctionRole) -> &'static str {
    match role {
        FunctionRole::Planner => PLANNER_TEMPLATE,
        FunctionRole::ActionPlanner => ACTION_PLANNER_TEMPLATE,
        FunctionRole::Reasoner => REASONER_TEMPLATE,
        FunctionRole::CompletionChecker => COMPLETION_CHECKER_TEMPLATE,
        FunctionRole::Summarizer => SUMMARIZER_TEMPLATE,
        FunctionRole::ParameterGenerator => PARAMETER_GENERATOR_TEMPLATE,
        FunctionRole::TextTransformer => TEXT_TRANSFORMER_TEMPLATE,
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(marker), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |next| next.start());
        let content = rendered[marker.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

const SEPARATOR: &str = "\n\n";

/// Bytes of the joined prompt, separators included.
fn total_len(sections: &[Section]) -> usize {
    let content: usize = sections.iter().map(|s| s.content.len()).sum();
    content + SEPARATOR.len() * sections.len().saturating_sub(1)
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(section = key, bytes_dropped = sections[idx].content.len(), "dropped prompt section");
            sections.remove(idx);
        }
    }
    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let joined = if rest.is_empty() { 0 } else { total_len(rest) + SEPARATOR.len() };
    let allowed = budget.saturating_sub(joined);
    let before_len = last.content.len();
    const MARK: &str = "\n[truncated]";
    let keep = if allowed > MARK.len() { allowed - MARK.len() } else { allowed };
    let mut cut = keep.min(last.content.len());
    while !last.content.is_char_boundary(cut) {
        cut -= 1;
    }
    last.content.truncate(cut);
    if allowed > MARK.len() {
        last.content.push_str(MARK);
    }
    debug!(section = %last.key, before_len, after_len = last.content.len(), "truncated prompt section");
}

/// Parameters as template-friendly strings: text stays as-is, anything else
/// is pretty JSON.
fn display_parameters(context: &InvocationContext) -> BTreeMap<String, String> {
    context
        .parameters
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let text = match value {
                Value::String(text) => text.clone(),
                other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
            };
            (key.clone(), text)
        })
        .collect()
}

/// Renders role prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        for role in FunctionRole::ALL {
            env.add_template(role.as_str(), template_source(role))
                .with_context(|| format!("load {role} template"))?;
        }
        Ok(Self { env, budget_bytes })
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }

    pub fn build(&self, role: FunctionRole, input: &InvocationContext) -> Result<String> {
        let params = display_parameters(input);
        let parameters = (!input.parameters.is_empty())
            .then(|| serde_json::to_string_pretty(&input.parameters))
            .transpose()
            .context("serialize prompt parameters")?;
        let aux: BTreeMap<&str, &str> = input
            .auxiliary
            .iter()
            .map(|(key, text)| (key.as_str(), text.trim()))
            .filter(|(_, text)| !text.is_empty())
            .collect();
        let rendered = self
            .env
            .get_template(role.as_str())?
            .render(context! {
                goal => input.goal.trim(),
                params => params,
                parameters => parameters,
                aux => aux,
            })
            .with_context(|| format!("render {role} prompt"))?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join(SEPARATOR))
    }
}
