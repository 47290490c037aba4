//! Placeholder substitution for step parameter templates.
//!
//! Supported forms: `{var}`, `{var.property}`, `{var[index]}` and
//! `{var.property[index]}`. Anything that cannot be resolved is left in the
//! output verbatim; substitution itself never fails.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::bindings::{BindingContext, as_json, render_value};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?(?:\[(\d+)\])?\}")
        .expect("placeholder regex should be valid")
});

/// Property names consulted when a placeholder has neither property nor index.
pub const DEFAULT_CONTENT_PROPERTIES: [&str; 5] =
    ["transformedText", "content", "output", "result", "data"];

/// Property names searched for an array when indexing into an object.
pub const DEFAULT_ARRAY_PROPERTIES: [&str; 5] = ["files", "items", "data", "results", "list"];

/// Name lists driving the extraction heuristics. Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionRules {
    pub content_properties: Vec<String>,
    pub array_properties: Vec<String>,
}

impl Default for SubstitutionRules {
    fn default() -> Self {
        Self {
            content_properties: DEFAULT_CONTENT_PROPERTIES.map(String::from).to_vec(),
            array_properties: DEFAULT_ARRAY_PROPERTIES.map(String::from).to_vec(),
        }
    }
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub variable: String,
    pub property: Option<String>,
    pub index: Option<usize>,
}

impl Reference {
    fn from_captures(caps: &Captures<'_>) -> Option<Self> {
        let variable = caps.get(1)?.as_str().to_string();
        let property = caps.get(2).map(|m| m.as_str().to_string());
        let index = match caps.get(3) {
            Some(m) => Some(m.as_str().parse::<usize>().ok()?),
            None => None,
        };
        Some(Self {
            variable,
            property,
            index,
        })
    }
}

/// All well-formed placeholder references in `template`, in order.
pub fn references(template: &str) -> Vec<Reference> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .filter_map(|caps| Reference::from_captures(&caps))
        .collect()
}

/// Replace every resolvable placeholder in `template` with its bound value.
///
/// When the template looks like a JSON body (starts with `{` and contains a
/// quote) inserted text is JSON-string-escaped so the result stays valid JSON.
pub fn substitute(template: &str, bindings: &BindingContext, rules: &SubstitutionRules) -> String {
    let escape = looks_like_json_body(template);
    PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let original = caps.get(0).map_or("", |m| m.as_str());
            let resolved = Reference::from_captures(caps)
                .and_then(|reference| resolve(&reference, bindings, rules));
            match resolved {
                Some(text) if escape => escape_json_text(&text),
                Some(text) => text,
                None => original.to_string(),
            }
        })
        .into_owned()
}

/// Placeholders in `template` whose variable has no binding.
pub fn unbound_variables(template: &str, bindings: &BindingContext) -> Vec<String> {
    references(template)
        .into_iter()
        .filter(|reference| !bindings.contains(&reference.variable))
        .map(|reference| reference.variable)
        .collect()
}

/// Resolve a single reference to text, or `None` to leave it verbatim.
pub fn resolve(
    reference: &Reference,
    bindings: &BindingContext,
    rules: &SubstitutionRules,
) -> Option<String> {
    let bound = bindings.get(&reference.variable)?;

    let value = match (&reference.property, reference.index) {
        (Some(property), _) => {
            let json = as_json(bound)?;
            property_ignore_case(&json, property)?.clone()
        }
        (None, None) => return Some(render_value(&primary_content(bound, rules))),
        (None, Some(_)) => bound.clone(),
    };

    match reference.index {
        None => Some(render_value(&value)),
        Some(index) => element_at(&value, index, rules).map(|element| render_value(&element)),
    }
}

/// For a JSON object, the first content-bearing property; otherwise the value.
fn primary_content(value: &Value, rules: &SubstitutionRules) -> Value {
    if let Some(json @ Value::Object(_)) = as_json(value) {
        for name in &rules.content_properties {
            if let Some(found) = property_ignore_case(&json, name) {
                return found.clone();
            }
        }
    }
    value.clone()
}

fn element_at(value: &Value, index: usize, rules: &SubstitutionRules) -> Option<Value> {
    match as_json(value)? {
        Value::Array(items) => items.into_iter().nth(index),
        json @ Value::Object(_) => rules
            .array_properties
            .iter()
            .find_map(|name| match property_ignore_case(&json, name) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .and_then(|items| items.get(index).cloned()),
        _ => None,
    }
}

/// Exact match first, then the first case-insensitive match.
fn property_ignore_case<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, found)| found)
    })
}

fn looks_like_json_body(template: &str) -> bool {
    template.trim_start().starts_with('{') && template.contains('"')
}

fn escape_json_text(text: &str) -> String {
    let quoted = Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(entries: &[(&str, Value)]) -> BindingContext {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn indexes_into_conventional_array_property() {
        let ctx = bindings(&[("fileList", json!(r#"{"files": ["a.txt", "b.txt"]}"#))]);
        let out = substitute("{fileList[1]}", &ctx, &SubstitutionRules::default());
        assert_eq!(out, "b.txt");
    }

    #[test]
    fn plain_variable_prefers_content_over_output() {
        let ctx = bindings(&[("fileList", json!({"Content": "hello", "Output": "world"}))]);
        let out = substitute("{fileList}", &ctx, &SubstitutionRules::default());
        assert_eq!(out, "hello");
    }

    #[test]
    fn missing_variable_is_left_verbatim() {
        let ctx = bindings(&[("present", json!("x"))]);
        let out = substitute("a {missingVar} b {present}", &ctx, &SubstitutionRules::default());
        assert_eq!(out, "a {missingVar} b x");
    }

    #[test]
    fn property_lookup_is_case_insensitive() {
        let ctx = bindings(&[("user", json!(r#"{"Name": "Ada", "tags": ["x", "y"]}"#))]);
        let rules = SubstitutionRules::default();
        assert_eq!(substitute("{user.name}", &ctx, &rules), "Ada");
        assert_eq!(substitute("{user.TAGS[0]}", &ctx, &rules), "x");
    }

    #[test]
    fn unresolvable_shapes_stay_verbatim() {
        let ctx = bindings(&[
            ("list", json!(["only"])),
            ("text", json!("not json")),
            ("obj", json!({"a": 1})),
        ]);
        let rules = SubstitutionRules::default();
        assert_eq!(substitute("{list[5]}", &ctx, &rules), "{list[5]}");
        assert_eq!(substitute("{text[0]}", &ctx, &rules), "{text[0]}");
        assert_eq!(substitute("{text.field}", &ctx, &rules), "{text.field}");
        assert_eq!(substitute("{obj.missing}", &ctx, &rules), "{obj.missing}");
    }

    #[test]
    fn plain_object_without_content_property_renders_raw_json() {
        let ctx = bindings(&[("obj", json!({"a": 1}))]);
        assert_eq!(
            substitute("{obj}", &ctx, &SubstitutionRules::default()),
            r#"{"a":1}"#
        );
    }

    #[test]
    fn json_body_templates_escape_inserted_text() {
        let ctx = bindings(&[("raw", json!("line one\n\"quoted\""))]);
        let out = substitute(r#"{"text":"{raw}"}"#, &ctx, &SubstitutionRules::default());
        let parsed: Value = serde_json::from_str(&out).expect("still valid json");
        assert_eq!(parsed["text"], "line one\n\"quoted\"");
    }

    #[test]
    fn custom_rules_change_priority() {
        let ctx = bindings(&[("r", json!({"content": "c", "summary": "s"}))]);
        let rules = SubstitutionRules {
            content_properties: vec!["summary".to_string()],
            array_properties: Vec::new(),
        };
        assert_eq!(substitute("{r}", &ctx, &rules), "s");
    }

    #[test]
    fn references_and_unbound_variables() {
        let refs = references(r#"{"a": "{x.y[2]}", "b": "{z}"}"#);
        assert_eq!(
            refs[0],
            Reference {
                variable: "x".to_string(),
                property: Some("y".to_string()),
                index: Some(2),
            }
        );
        let ctx = bindings(&[("x", json!("1"))]);
        assert_eq!(unbound_variables("{x} {z}", &ctx), vec!["z".to_string()]);
    }
}
